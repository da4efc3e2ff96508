use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use zstd::stream::AutoFinishEncoder;

pub fn find_files(
    path: &Path,
    prefix: Option<&str>,
    postfix: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let mut files = vec![];

    for entry in path.read_dir().context("read_dir call failed")? {
        let entry = entry.context("invalid dir entry")?;

        // filter files
        if !entry.path().is_file() {
            log::debug!("{:?} not a file", entry);
            continue;
        }

        // filter by filename prefix/postfix
        if prefix.is_some() || postfix.is_some() {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if let Some(prefix) = prefix {
                if !filename.starts_with(prefix) {
                    continue;
                }
            }

            if let Some(postfix) = postfix {
                if !filename.ends_with(postfix) {
                    continue;
                }
            }
        }

        files.push(entry.path());
    }

    files.sort_unstable();

    Ok(files)
}

pub fn bufwriter(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .with_context(|| format!("Failed to create file {path:?}"))
        .map(BufWriter::new)
}

pub fn decoder(path: &Path) -> Result<zstd::Decoder<'static, BufReader<File>>> {
    zstd::Decoder::new(File::open(path).with_context(|| format!("Failed to open file {path:?}"))?)
        .context("Failed to create zstd decoder")
}

pub fn encoder(path: &Path) -> Result<AutoFinishEncoder<'static, BufWriter<File>>> {
    zstd::Encoder::new(bufwriter(path)?, 0)
        .context("Failed to create zstd encoder")
        .map(|encoder| encoder.auto_finish())
}
