/// Build a `&[LogValue]` argument slice from heterogeneous values.
///
/// ```ignore
/// logger.info("user {Name} logged in from {Ip}", log_args!["ann", "10.0.0.1"]);
/// ```
#[macro_export]
macro_rules! log_args {
    () => {
        &[] as &[$crate::value::LogValue]
    };
    ($($arg:expr),+ $(,)?) => {
        &[$($crate::value::LogValue::from($arg)),+]
    };
}
