pub trait LogError<T> {
    /// log the error and turn the result into an `Option`
    fn log_error(self) -> Option<T>;
}

impl<T> LogError<T> for Result<T, anyhow::Error> {
    fn log_error(self) -> Option<T> {
        match self {
            Ok(data) => Some(data),
            Err(e) => {
                log::error!("{:?}", e);
                None
            }
        }
    }
}
