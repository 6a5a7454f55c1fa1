use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum Error {
    /// A command run by the container platform exited unsuccessfully.
    #[error("`{command}` failed with exit code {code:?}\nstdout: {stdout}\nstderr: {stderr}")]
    Exit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
