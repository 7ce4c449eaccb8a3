// External command runner for probes

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Run a command with a deadline and return its stdout
///
/// Missing binaries, non-zero exits and deadline overruns all yield
/// `None`; the child is killed if the deadline passes.
pub async fn run(program: &str, args: &[&str], deadline: Duration) -> Option<String> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(deadline, child).await {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            log::trace!("{} exited with {}", program, output.status);
            None
        }
        Ok(Err(e)) => {
            log::trace!("{} failed to run: {}", program, e);
            None
        }
        Err(_) => {
            log::debug!("{} timed out after {:?}", program, deadline);
            None
        }
    }
}

/// First number following `label` on any line
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn number_after(text: &str, label: &str) -> Option<f64> {
    text.lines().find_map(|line| {
        let (_, rest) = line.split_once(label)?;
        leading_number(rest)
    })
}

/// Parse the number at the start of `text`, skipping leading separators
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '=');
    let end = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let out = run("hostpulse-no-such-tool", &[], Duration::from_secs(1)).await;
        assert!(out.is_none());
    }

    #[test]
    fn test_number_after() {
        let text = "foo\nCPU Power: 1234 mW\nGPU Power: 5 mW\n";
        assert_eq!(number_after(text, "CPU Power"), Some(1234.0));
        assert_eq!(number_after(text, "ANE Power"), None);
        assert_eq!(leading_number(" = 12.5/13"), Some(12.5));
        assert_eq!(leading_number("abc"), None);
    }
}
