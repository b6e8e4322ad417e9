//! Request normalization: binds the executed argv to the command text the
//! operator sees. A request whose `rawCommand` disagrees with its argv is
//! rejected before anything else looks at it.

use crate::command::quote::format_argv;
use crate::command::shell::extract_shell_command_from_argv;
use crate::command::{ExecRequest, NormalizedCommand};
use crate::errors::{GateError, GateResult, RequestErrorCode};

/// Turn a request into the canonical (argv, shellCommand?, cmdText) triple.
///
/// `rawCommand`, when present, must equal either the shell-quoted rendering
/// of the argv (direct form) or the embedded command of a recognized shell
/// wrapper. Anything else is `RAW_COMMAND_MISMATCH`.
pub fn normalize_request(request: &ExecRequest) -> GateResult<NormalizedCommand> {
    if request.command.is_empty() {
        return Err(GateError::invalid(
            RequestErrorCode::MissingCommand,
            "command must be a non-empty argv",
        ));
    }

    let shell_command = extract_shell_command_from_argv(&request.command);

    if let Some(raw) = &request.raw_command {
        let direct = format_argv(&request.command);
        let matches_direct = *raw == direct;
        let matches_wrapped = shell_command.as_deref() == Some(raw.as_str());
        if !matches_direct && !matches_wrapped {
            return Err(GateError::invalid(
                RequestErrorCode::RawCommandMismatch,
                format!("rawCommand does not match command argv (expected {direct:?})"),
            ));
        }
    }

    let cmd_text = shell_command
        .clone()
        .unwrap_or_else(|| format_argv(&request.command));

    Ok(NormalizedCommand {
        argv: request.command.clone(),
        shell_command,
        cmd_text,
    })
}
