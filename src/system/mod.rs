use std::{
    io,
    process::{Command, Stdio},
};

#[cfg(target_os = "linux")]
pub mod gsettings;

pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub fn run_silent_with_output(program: &str, arguments: &[&str]) -> io::Result<CommandOutput> {
    log::debug!("[cmd] {} {}", program, arguments.join(" "));
    let output = Command::new(program)
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .inspect_err(|error| log::debug!("[cmd] spawn error for {program}: {error}"))?;

    let success = output.status.success();
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !success {
        log::debug!(
            "[cmd] FAILED (exit {}): {} {}\n  stdout: {}\n  stderr: {}",
            output.status.code().unwrap_or(-1),
            program,
            arguments.join(" "),
            stdout.trim(),
            stderr.trim(),
        );
    } else {
        log::trace!(
            "[cmd] OK: {} {} → stdout={}",
            program,
            arguments.join(" "),
            stdout.trim(),
        );
    }

    Ok(CommandOutput {
        success,
        stdout,
        stderr,
    })
}
