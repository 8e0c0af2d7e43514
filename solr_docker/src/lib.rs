use std::{error::Error, num::NonZeroI32};

pub(crate) mod config;
pub(crate) mod docker;
pub(crate) mod fingerprint;
pub(crate) mod layout;
pub(crate) mod package;
pub(crate) mod pipeline;
pub(crate) mod process;
pub(crate) mod state;
pub(crate) mod temp_path;

pub mod cli;

pub(crate) type Result<T, E = Box<dyn Error + Send + Sync + 'static>> =
    std::result::Result<T, E>;

/// The exit code to terminate with after `error`. Forwards the exit code of a failed external
/// command or of the first failed test case, and falls back to `1`.
pub fn exit_code(error: &(dyn Error + Send + Sync + 'static)) -> i32 {
    let code = if let Some(error) = error.downcast_ref::<process::Error>() {
        error.exit_code()
    } else if let Some(error) = error.downcast_ref::<image_tests::TestsFailed>() {
        error.exit_code()
    } else {
        None
    };
    code.map_or(1, NonZeroI32::get)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{fake::FakeRunner, Runner};

    #[test]
    fn exit_code_is_forwarded() {
        let runner = FakeRunner::with_handler(|_| 42);
        let error: Box<dyn Error + Send + Sync> = runner
            .run(process::command!("docker", "push", "apache/solr:9.5.0"))
            .unwrap_err()
            .into();
        assert_eq!(exit_code(&*error), 42);

        let error: Box<dyn Error + Send + Sync> = "image identifier file is empty".into();
        assert_eq!(exit_code(&*error), 1);
    }
}
