//! Splits a free-form command template into argv.
//!
//! Honors single/double quotes and backslash line continuations the way a
//! shell would, strips `# ...` comment lines, and expands ordered
//! placeholders: `${PORT}` and `${MODEL_ID}` for the start command,
//! `${PID}` for the stop command.

use switchboard_core::CoreError;

/// Expand `${PORT}` and `${MODEL_ID}` in a command template, then
/// shell-tokenize it into argv.
pub fn expand_start_command(template: &str, port: u16, model_id: &str) -> Result<Vec<String>, CoreError> {
    let expanded = template
        .replace("${PORT}", &port.to_string())
        .replace("${MODEL_ID}", model_id);
    tokenize(&expanded)
}

/// Expand `${PID}` in a stop command template, then shell-tokenize it.
pub fn expand_stop_command(template: &str, pid: u32) -> Result<Vec<String>, CoreError> {
    let expanded = template.replace("${PID}", &pid.to_string());
    tokenize(&expanded)
}

/// Strip comment lines, join backslash-continued lines, and split the
/// result into argv honoring quotes.
fn tokenize(command: &str) -> Result<Vec<String>, CoreError> {
    let joined = join_lines(command);
    let argv = shell_words::split(&joined)
        .map_err(|e| CoreError::StartFailed(format!("invalid command syntax: {e}")))?;
    if argv.is_empty() {
        return Err(CoreError::StartFailed("empty command".to_string()));
    }
    Ok(argv)
}

fn join_lines(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    for line in command.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            out.push_str(stripped);
            out.push(' ');
        } else {
            out.push_str(line);
            out.push(' ');
        }
    }
    out
}
