//! Line-at-a-time receive accumulator and argument parser.
//!
//! Every byte-stream device (cellular modem, LoRa modem, bGeigie,
//! phone channel) feeds a `CmdBuf`. The buffer collects one line of
//! printable ASCII, flags it `complete` on newline or overflow, and
//! parks any bytes that arrive before the owner has consumed the line
//! in a circular "busy" buffer. Parsing is keyword-oriented: state
//! machine handlers test the current argument against lowercase
//! patterns and walk the line token by token.
//!
//! The `state` field is an opaque tag owned by whichever state machine
//! drives the stream; `CmdBuf` only reports when it changes so the
//! owner can feed its watchdog.

use log::{debug, warn};

/// Longest accepted line; anything longer completes early.
pub const MAX_LINE: usize = 128;

/// Capacity of the circular busy buffer (bytes parked while a
/// completed line waits to be consumed).
pub const BUSY_CAPACITY: usize = 256;

/// Identifies which byte stream a buffer (or completion event) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Lora,
    Fona,
    /// Deferred-payload prompt for the cellular modem (`>` received).
    FonaDeferred,
    Bgeigie,
    Phone,
}

/// Line accumulator shared by all byte-stream devices.
pub struct CmdBuf {
    stream: Stream,
    state: u16,
    buffer: Vec<u8>,
    /// Index of the next unparsed character.
    args: usize,
    /// Index just past the most recent match.
    nextarg: usize,
    complete: bool,
    /// Bitmap of reply fragments observed in the current state.
    recognized: u32,
    busy: [u8; BUSY_CAPACITY],
    busy_length: usize,
    busy_nextput: usize,
    busy_nextget: usize,
    busy_overflows: u32,
}

impl CmdBuf {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            state: 0,
            buffer: Vec::with_capacity(MAX_LINE),
            args: 0,
            nextarg: 0,
            complete: false,
            recognized: 0,
            busy: [0; BUSY_CAPACITY],
            busy_length: 0,
            busy_nextput: 0,
            busy_nextget: 0,
            busy_overflows: 0,
        }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn state(&self) -> u16 {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The accumulated line. Token matching may have overwritten
    /// in-line separators with NUL; those read as end-of-string to
    /// [`rest`](Self::rest) but are preserved here.
    pub fn line(&self) -> &str {
        std::str::from_utf8(&self.buffer).unwrap_or("")
    }

    /// Bytes parked behind the current line.
    pub fn busy_len(&self) -> usize {
        self.busy_length
    }

    pub fn busy_overflows(&self) -> u32 {
        self.busy_overflows
    }

    /// Append one received byte.
    ///
    /// Returns true exactly when this byte completed a line: a newline
    /// arriving on a non-empty buffer, or the byte that fills the
    /// buffer to [`MAX_LINE`]. While a completed line is pending, the
    /// byte is parked in the busy buffer instead.
    pub fn append(&mut self, databyte: u8) -> bool {
        if self.complete {
            if self.busy_length < BUSY_CAPACITY {
                self.busy[self.busy_nextput] = databyte;
                self.busy_nextput = (self.busy_nextput + 1) % BUSY_CAPACITY;
                self.busy_length += 1;
            } else {
                self.busy_overflows += 1;
                warn!("{:?} busy buffer overflow, byte dropped", self.stream);
            }
            return false;
        }

        if databyte == b'\n' {
            if !self.buffer.is_empty() {
                self.complete = true;
                return true;
            }
            return false;
        }

        // Only printable ASCII is accumulated; everything else is noise
        // from modem framing or line endings.
        if (0x20..0x7f).contains(&databyte) {
            self.buffer.push(databyte);
            if self.buffer.len() >= MAX_LINE {
                self.complete = true;
                return true;
            }
        }

        false
    }

    /// Clear the current line, then drain the busy buffer through
    /// normal ingestion. Returns true if the drained bytes produced
    /// another complete line (the owner should schedule another
    /// processing pass).
    pub fn reset(&mut self) -> bool {
        self.buffer.clear();
        self.args = 0;
        self.nextarg = 0;
        self.complete = false;

        while self.busy_length > 0 {
            self.busy_length -= 1;
            let databyte = self.busy[self.busy_nextget];
            self.busy_nextget = (self.busy_nextget + 1) % BUSY_CAPACITY;
            if self.append(databyte) {
                return true;
            }
        }
        false
    }

    /// Change the state tag, resetting the line and the recognition
    /// bitmap. Returns true when the state actually changed, which the
    /// owning transport uses to feed its watchdog.
    pub fn set_state(&mut self, newstate: u16) -> bool {
        let changed = self.state != newstate;
        self.reset();
        self.state = newstate;
        self.recognized = 0;
        changed
    }

    /// Record that a reply fragment was observed.
    pub fn seen(&mut self, mask: u32) {
        self.recognized |= mask;
    }

    /// True once every fragment in `mask` has been observed.
    pub fn all_seen(&self, mask: u32) -> bool {
        self.recognized & mask == mask
    }

    /// Test the current argument against a lowercase pattern.
    ///
    /// Three pattern forms are understood:
    ///
    /// | pattern | meaning |
    /// |---|---|
    /// | `"foo"`  | the word `foo` followed by a separator or end of line |
    /// | `"foo*"` | anything beginning with `foo` |
    /// | `"*"`    | consume the next whole token, terminating it in place |
    ///
    /// Separators are `,`, `;`, space (unless the pattern itself
    /// contains a space) and any non-printable byte. On a match,
    /// `nextarg` is left pointing past the token and any contiguous
    /// separators.
    pub fn this_arg_is(&mut self, pattern: &str) -> bool {
        let pat = pattern.as_bytes();
        let embedded_spaces = pat.contains(&b' ');

        let mut test_len = pat.len();
        let mut test_for_word = true;
        let mut token_mode = false;
        if test_len > 0 && pat[test_len - 1] == b'*' {
            test_len -= 1;
            if test_len != 0 {
                test_for_word = false;
            } else {
                token_mode = true;
            }
        }

        // Always leave nextarg pointing at the next thing to parse.
        self.nextarg = self.args;

        if !token_mode {
            if test_len > self.buffer.len() - self.args {
                return false;
            }
            for i in 0..test_len {
                if pat[i] != self.buffer[self.args + i].to_ascii_lowercase() {
                    return false;
                }
            }
            self.nextarg += test_len;
            if test_len == self.buffer.len() - self.args {
                return true;
            }
        }

        if token_mode {
            while self.nextarg < self.buffer.len()
                && !is_arg_separator(self.buffer[self.nextarg], embedded_spaces)
            {
                self.nextarg += 1;
            }
        }

        if test_for_word && self.nextarg < self.buffer.len() {
            if !is_arg_separator(self.buffer[self.nextarg], embedded_spaces) {
                return false;
            }
            let mut i = self.nextarg;
            while i < self.buffer.len() {
                if !is_arg_separator(self.buffer[i], embedded_spaces) {
                    break;
                }
                if token_mode {
                    // Terminate the extracted token in place.
                    self.buffer[i] = 0;
                }
                i += 1;
            }
            self.nextarg = i;
        }

        true
    }

    /// Return the current argument and advance to the next one.
    pub fn next_arg(&mut self) -> String {
        let arg = self.rest().to_string();
        self.args = self.nextarg;
        arg
    }

    /// The unparsed remainder of the line, up to any in-place token
    /// terminator.
    pub fn rest(&self) -> &str {
        let tail = &self.buffer[self.args.min(self.buffer.len())..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    /// Diagnostic one-liner for the operator CLI.
    pub fn describe(&self) -> String {
        format!(
            "st={} cc={} b={},{},{} '{}'",
            self.state,
            self.complete,
            self.busy_length,
            self.busy_nextput,
            self.busy_nextget,
            self.line()
        )
    }
}

fn is_arg_separator(databyte: u8, embedded_spaces: bool) -> bool {
    if !embedded_spaces && databyte == b' ' {
        return true;
    }
    if databyte == b',' || databyte == b';' {
        return true;
    }
    // Anything non-printable separates as well.
    !(0x20..0x7f).contains(&databyte)
}

/// Feed a full string through a buffer, as tests and the host
/// simulator do.
pub fn feed_line(cmd: &mut CmdBuf, line: &str) -> bool {
    let mut completed = false;
    for b in line.bytes() {
        completed |= cmd.append(b);
    }
    completed |= cmd.append(b'\n');
    if completed {
        debug!("{:?} < {}", cmd.stream(), cmd.line());
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed(line: &str) -> CmdBuf {
        let mut cmd = CmdBuf::new(Stream::Fona);
        feed_line(&mut cmd, line);
        cmd
    }

    // ==================== Framing ====================

    #[test]
    fn test_newline_completes_nonempty_line() {
        let mut cmd = CmdBuf::new(Stream::Fona);
        assert!(!cmd.append(b'O'));
        assert!(!cmd.append(b'K'));
        assert!(cmd.append(b'\n'));
        assert!(cmd.is_complete());
        assert_eq!(cmd.line(), "OK");
    }

    #[test]
    fn test_blank_lines_do_not_complete() {
        let mut cmd = CmdBuf::new(Stream::Fona);
        assert!(!cmd.append(b'\r'));
        assert!(!cmd.append(b'\n'));
        assert!(!cmd.append(b'\n'));
        assert!(!cmd.is_complete());
    }

    #[test]
    fn test_nonprintable_bytes_dropped() {
        let mut cmd = CmdBuf::new(Stream::Fona);
        for b in [0x01u8, 0x07, 0x1f, 0x7f, 0xff] {
            assert!(!cmd.append(b));
        }
        assert!(!cmd.is_complete());
        assert!(cmd.is_empty());
    }

    #[test]
    fn test_overflow_completes_exactly_once() {
        let mut cmd = CmdBuf::new(Stream::Fona);
        let mut completions = 0;
        for _ in 0..MAX_LINE {
            if cmd.append(b'x') {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert!(cmd.is_complete());
        assert_eq!(cmd.len(), MAX_LINE);
    }

    #[test]
    fn test_one_completion_per_newline() {
        // The first line completes and stays pending; everything after
        // it parks in the busy buffer without raising completions.
        let mut cmd = CmdBuf::new(Stream::Fona);
        let mut completions = 0;
        for b in "first\nsecond\nthird\n".bytes() {
            if cmd.append(b) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(cmd.line(), "first");
        assert!(cmd.busy_len() > 0);
    }

    // ==================== Busy buffer ====================

    #[test]
    fn test_busy_bytes_surface_after_reset_in_order() {
        let mut cmd = CmdBuf::new(Stream::Fona);
        feed_line(&mut cmd, "first");
        for b in "second\n".bytes() {
            cmd.append(b);
        }
        assert_eq!(cmd.line(), "first");
        assert!(cmd.busy_len() > 0);
        assert!(cmd.reset());
        assert_eq!(cmd.line(), "second");
        assert!(!cmd.reset());
        assert_eq!(cmd.busy_len(), 0);
    }

    #[test]
    fn test_busy_overflow_drops_and_counts() {
        let mut cmd = CmdBuf::new(Stream::Fona);
        feed_line(&mut cmd, "line");
        for _ in 0..(BUSY_CAPACITY + 10) {
            cmd.append(b'z');
        }
        assert_eq!(cmd.busy_len(), BUSY_CAPACITY);
        assert_eq!(cmd.busy_overflows(), 10);
    }

    #[test]
    fn test_reset_stops_at_next_complete() {
        let mut cmd = CmdBuf::new(Stream::Fona);
        feed_line(&mut cmd, "a");
        for b in "b\nc\n".bytes() {
            cmd.append(b);
        }
        assert!(cmd.reset());
        assert_eq!(cmd.line(), "b");
        // "c\n" still parked.
        assert!(cmd.busy_len() > 0);
        assert!(cmd.reset());
        assert_eq!(cmd.line(), "c");
    }

    // ==================== Word matching ====================

    #[test]
    fn test_word_match_is_case_insensitive() {
        assert!(fed("OK").this_arg_is("ok"));
        assert!(fed("Ok").this_arg_is("ok"));
        assert!(fed("ok").this_arg_is("ok"));
    }

    #[test]
    fn test_word_match_requires_delimiter() {
        assert!(fed("ok,").this_arg_is("ok"));
        assert!(fed("ok more").this_arg_is("ok"));
        assert!(!fed("okay").this_arg_is("ok"));
        assert!(fed("okay").this_arg_is("ok*"));
    }

    #[test]
    fn test_wildcard_prefix_match() {
        assert!(fed("+cgpsinfo: 1,2").this_arg_is("+cgpsinfo:*"));
        assert!(!fed("+cgps: 1").this_arg_is("+cgpsinfo:*"));
    }

    #[test]
    fn test_embedded_space_pattern_keeps_spaces() {
        // A pattern with a space must not treat space as a separator.
        assert!(fed("+cpin: ready").this_arg_is("+cpin: ready"));
        assert!(fed("pb done").this_arg_is("pb done"));
        assert!(!fed("pb").this_arg_is("pb done"));
    }

    #[test]
    fn test_token_mode_extracts_and_advances() {
        let mut cmd = fed("one,two;three");
        assert!(cmd.this_arg_is("*"));
        assert_eq!(cmd.next_arg(), "one");
        assert!(cmd.this_arg_is("*"));
        assert_eq!(cmd.next_arg(), "two");
        assert!(cmd.this_arg_is("*"));
        assert_eq!(cmd.next_arg(), "three");
    }

    #[test]
    fn test_token_mode_empty_field() {
        // Consecutive separators still yield a (possibly empty) token.
        let mut cmd = fed("a,,c");
        assert!(cmd.this_arg_is("*"));
        assert_eq!(cmd.next_arg(), "a");
        assert!(cmd.this_arg_is("*"));
        // The run of separators after "a" was consumed with it.
        assert_eq!(cmd.next_arg(), "c");
    }

    #[test]
    fn test_rest_after_keyword() {
        let mut cmd = fed("+iccid: 8901260712345678");
        assert!(cmd.this_arg_is("+iccid:"));
        cmd.next_arg();
        assert_eq!(cmd.rest(), "8901260712345678");
    }

    // ==================== State handling ====================

    #[test]
    fn test_set_state_reports_change() {
        let mut cmd = CmdBuf::new(Stream::Lora);
        assert!(cmd.set_state(5));
        assert!(!cmd.set_state(5));
        assert!(cmd.set_state(6));
    }

    #[test]
    fn test_set_state_clears_recognized() {
        let mut cmd = CmdBuf::new(Stream::Lora);
        cmd.seen(0x3);
        assert!(cmd.all_seen(0x3));
        cmd.set_state(2);
        assert!(!cmd.all_seen(0x1));
    }
}
