//! Command framing for a shared shell.
//!
//! Each command is followed by a trailer that prints a unique token and the
//! command's exit status on stdout, and the token alone on stderr. A command
//! is complete once both tokens were seen; everything before them is its
//! output.

/// Name of the shell variable holding the exit status between the command
/// and the trailer.
const STATUS_VAR: &str = "__unishell_rc";

/// Build the text written to the shell's stdin for `command`.
pub(crate) fn frame(command: &str, token: &str) -> String {
    format!(
        "{command}\n{var}=$?; printf '%s%d\\n' '{token}' \"${var}\"; printf '%s\\n' '{token}' >&2\n",
        var = STATUS_VAR,
    )
}

/// Outcome of feeding bytes to a [`MarkerScanner`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Scan {
    /// No marker yet. `emit` is output that can no longer be part of one.
    Pending { emit: Vec<u8> },
    /// Marker found. `emit` is the output before it, `rest` what followed
    /// the marker line.
    Found {
        emit: Vec<u8>,
        code: Option<i32>,
        rest: Vec<u8>,
    },
}

/// Finds a marker line in a byte stream that arrives in arbitrary pieces.
///
/// The token may appear mid-line (when the command's output does not end in
/// a newline). Bytes that could be the start of a split token are held back
/// until the next feed decides.
#[derive(Debug)]
pub(crate) struct MarkerScanner {
    token: Vec<u8>,
    with_code: bool,
    held: Vec<u8>,
}

impl MarkerScanner {
    /// Scanner for the stdout trailer (token followed by the exit status).
    pub(crate) fn stdout(token: &str) -> Self {
        Self::new(token, true)
    }

    /// Scanner for the stderr trailer (token alone).
    pub(crate) fn stderr(token: &str) -> Self {
        Self::new(token, false)
    }

    fn new(token: &str, with_code: bool) -> Self {
        Self {
            token: token.as_bytes().to_vec(),
            with_code,
            held: Vec::new(),
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) -> Scan {
        let mut buf = std::mem::take(&mut self.held);
        buf.extend_from_slice(data);

        let Some(start) = find(&buf, &self.token) else {
            let keep = partial_suffix(&buf, &self.token);
            self.held = buf.split_off(buf.len() - keep);
            return Scan::Pending { emit: buf };
        };

        let after = start + self.token.len();
        let Some(newline) = buf[after..].iter().position(|&b| b == b'\n') else {
            // Token seen but its line is incomplete.
            self.held = buf.split_off(start);
            return Scan::Pending { emit: buf };
        };

        let line_end = after + newline;
        let code = if self.with_code {
            std::str::from_utf8(&buf[after..line_end])
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
        } else {
            None
        };
        let rest = buf[line_end + 1..].to_vec();
        buf.truncate(start);
        Scan::Found {
            emit: buf,
            code,
            rest,
        }
    }

    /// Release whatever is still held back.
    pub(crate) fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.held)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of `token`.
fn partial_suffix(buf: &[u8], token: &[u8]) -> usize {
    let max = token.len().saturating_sub(1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&n| buf[buf.len() - n..] == token[..n])
        .unwrap_or(0)
}
