//! Shared subprocess plumbing for the kernel-utility drivers.

use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to run {bin}: {source}")]
    Io {
        bin: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{bin} {args} failed (status {code:?}): {stderr}")]
    Failed {
        bin: &'static str,
        args: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Runs `bin` with `args`, optionally feeding `input` on stdin, and returns
/// the raw output for the caller to interpret.
pub(crate) async fn exec(
    bin: &'static str,
    args: &[String],
    input: Option<&str>,
) -> Result<std::process::Output, DriverError> {
    let mut command = Command::new(bin);
    command
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| DriverError::Io { bin, source })?;

    if let Some(input) = input {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|source| DriverError::Io { bin, source })?;
    }

    child
        .wait_with_output()
        .await
        .map_err(|source| DriverError::Io { bin, source })
}

/// Like [`exec`], but any non-zero exit is an error.
pub(crate) async fn run(
    bin: &'static str,
    args: &[String],
    input: Option<&str>,
) -> Result<String, DriverError> {
    let output = exec(bin, args, input).await?;
    if !output.status.success() {
        return Err(failure(bin, args, &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn failure(
    bin: &'static str,
    args: &[String],
    output: &std::process::Output,
) -> DriverError {
    DriverError::Failed {
        bin,
        args: args.join(" "),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}
