pub mod corpus {
    /// soft bound on retained inputs, eviction runs above this
    pub const MAX_CORPUS_SIZE: usize = 4096;
    /// eviction never shrinks the corpus below this floor
    pub const MIN_CORPUS_SIZE: usize = 64;

    /// minimum sampling weight, keeps every entry reachable
    pub const MIN_WEIGHT: f64 = 0.05;
    /// extra weight for frontier members
    pub const FRONTIER_WEIGHT: f64 = 4.0;
    /// extra weight for the most recently added entries
    pub const RECENCY_WEIGHT: f64 = 2.0;
    /// entries counting as "recent" for the recency bonus
    pub const RECENCY_WINDOW: usize = 32;

    /// rebuild the cached weighted index every N considerations
    pub const UPDATE_WEIGHT_INTERVAL: usize = 128;
}

pub mod mutation {
    use std::ops::RangeInclusive;

    /// stacked mutation count: 2^1 .. 2^5
    pub const MUTATION_COUNT_POW2: RangeInclusive<u32> = 1..=5;

    pub const MAX_RETRY: usize = 16;

    // max mutation block sizes
    pub const BLOCK_SIZES_DISTRIBUTION: [usize; 4] = [35, 35, 25, 5];
    pub const BLOCK_SIZES_POW2: [usize; 4] = [
        3, // 2^3 = 8
        5, // 2^5 = 32
        8, // 2^8 = 256
        12, // 2^12 = 4k
    ];

    pub const INTERESTING_VALUES_U8: [u8; 7] = [0x10, 0x20, 0x40, 0x64, 0x7f, 0x80, 0xff];
    pub const INTERESTING_VALUES_U16: [u16; 10] = [
        0x80, 0xff, 0x0100, 0x0200, 0x03e8, 0x1000, 0x7fff, 0x8000, 0xfffe, 0xffff,
    ];
    pub const INTERESTING_VALUES_U32: [u32; 8] = [
        0x8000,
        0xffff,
        0x0001_0000,
        0x05ff_ff05,
        0x7fff_ffff,
        0x8000_0000,
        0xfa00_00fa,
        0xffff_ffff,
    ];

    // dictionary token scan limits
    pub const DICT_MIN_LEN: usize = 4;
    pub const DICT_MAX_LEN: usize = 64;
}

pub mod channel {
    use std::time::Duration;

    pub const MAGIC: u64 = 0x534b_4144_4943_4831; // "SKADICH1"
    pub const VERSION: u32 = 1;

    pub const DEFAULT_CAPACITY: usize = 1 << 22; // 4 MiB per direction

    /// busy-wait spins before falling back to short sleeps
    pub const SPIN_LIMIT: usize = 1024;
    pub const BACKOFF_MIN: Duration = Duration::from_micros(10);
    pub const BACKOFF_MAX: Duration = Duration::from_millis(1);
}

pub mod driver {
    use std::time::Duration;

    pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_RSS_LIMIT_MB: u64 = 2048;

    /// fork server readiness wait
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    /// wait granularity for child exit polling
    pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

    pub const READY_BYTE: u8 = 0x52; // 'R'
    pub const GO_BYTE: u8 = 0x47; // 'G'
    pub const DONE_BYTE: u8 = 0x44; // 'D'
}

pub mod engine {
    pub const DEFAULT_BATCH_SIZE: usize = 32;
    pub const DEFAULT_MAX_INPUT_LEN: usize = 4096;

    /// result payloads larger than this are treated as corrupt
    pub const MAX_RESULT_SIZE: u64 = 1 << 24;
}

pub mod storage {
    use std::time::Duration;

    pub const PUT_RETRY_LIMIT: usize = 3;
    pub const PUT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

    /// single corpus record size limit (input bytes or encoded features)
    pub const MAX_RECORD_SIZE: u32 = 1 << 24;
}

pub mod statistics {
    use std::time::Duration;

    pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
    pub const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
}
