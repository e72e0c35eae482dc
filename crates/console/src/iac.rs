use crate::codes::*;

/// Output of one [`IacParser::feed`] call.
#[derive(Debug, Default, PartialEq)]
pub struct Parsed {
    /// User payload with telnet commands removed.
    pub data: Vec<u8>,
    /// Negotiation replies to write back to the client.
    pub reply: Vec<u8>,
    /// Decoded NAWS window size (columns, rows), when one completed.
    pub window_size: Option<(u16, u16)>,
}

#[derive(Clone, Copy)]
enum State {
    Data,
    /// Saw IAC, awaiting the command byte.
    Command,
    /// Saw IAC WILL/WONT/DO/DONT, awaiting the option byte.
    Option(u8),
    /// Inside IAC SB … IAC SE; accumulating the payload.
    Subnegotiation { saw_iac: bool },
}

/// Byte-level telnet command parser.
///
/// Resumable: sequences split across reads complete on the next `feed`.
/// Unsupported commands are dropped from the stream; user data is never
/// discarded.
pub struct IacParser {
    state: State,
    sub: Vec<u8>,
    binary: bool,
    /// Carries a trailing '\r' across chunk boundaries for CRLF translation.
    pending_cr: bool,
}

impl IacParser {
    pub fn new(binary: bool) -> Self {
        Self {
            state: State::Data,
            sub: Vec::new(),
            binary,
            pending_cr: false,
        }
    }

    pub fn feed(&mut self, input: &[u8]) -> Parsed {
        let mut out = Parsed::default();
        for &byte in input {
            match self.state {
                State::Data => {
                    if byte == IAC {
                        self.state = State::Command;
                    } else {
                        out.data.push(byte);
                    }
                }
                State::Command => match byte {
                    IAC => {
                        // Escaped 0xff: data, not a command.
                        out.data.push(IAC);
                        self.state = State::Data;
                    }
                    AYT => {
                        tracing::debug!("telnet client sent Are-You-There");
                        out.reply
                            .extend_from_slice(b"\r\nYour Are-You-There received. I am here.\r\n");
                        self.state = State::Data;
                    }
                    NOP => self.state = State::Data,
                    WILL | WONT | DO | DONT => self.state = State::Option(byte),
                    SB => {
                        self.sub.clear();
                        self.state = State::Subnegotiation { saw_iac: false };
                    }
                    other => {
                        tracing::debug!(command = other, "unhandled telnet command");
                        self.state = State::Data;
                    }
                },
                State::Option(command) => {
                    self.negotiate(command, byte, &mut out);
                    self.state = State::Data;
                }
                State::Subnegotiation { saw_iac } => {
                    if saw_iac {
                        match byte {
                            SE => {
                                self.subnegotiate(&mut out);
                                self.state = State::Data;
                            }
                            IAC => {
                                self.sub.push(IAC);
                                self.state = State::Subnegotiation { saw_iac: false };
                            }
                            _ => {
                                // Unknown escape inside SB; drop both bytes.
                                self.state = State::Subnegotiation { saw_iac: false };
                            }
                        }
                    } else if byte == IAC {
                        self.state = State::Subnegotiation { saw_iac: true };
                    } else {
                        self.sub.push(byte);
                    }
                }
            }
        }

        if !self.binary {
            out.data = self.translate_crlf(out.data);
        }
        out
    }

    fn negotiate(&self, command: u8, option: u8, out: &mut Parsed) {
        match (command, option) {
            (DO, SGA) => {
                let verb = if self.binary { WILL } else { WONT };
                out.reply.extend_from_slice(&[IAC, verb, SGA]);
            }
            (DO, ECHO) | (DO, BINARY) => {
                // Already announced in the intro; nothing further to do.
            }
            (DO, option) => {
                out.reply.extend_from_slice(&[IAC, WONT, option]);
                tracing::debug!(option, "telnet WON'T");
            }
            (WILL, BINARY) | (WILL, NAWS) => {}
            (command, option) => {
                tracing::debug!(command, option, "unhandled telnet negotiation");
            }
        }
    }

    fn subnegotiate(&mut self, out: &mut Parsed) {
        match self.sub.split_first() {
            Some((&NAWS, payload)) => {
                if payload.len() == 4 {
                    let columns = u16::from_be_bytes([payload[0], payload[1]]);
                    let rows = u16::from_be_bytes([payload[2], payload[3]]);
                    out.window_size = Some((columns, rows));
                } else {
                    tracing::warn!(len = payload.len(), "wrong number of NAWS bytes");
                }
            }
            _ => {
                tracing::debug!(len = self.sub.len(), "unsupported negotiation sequence");
            }
        }
        self.sub.clear();
    }

    fn translate_crlf(&mut self, data: Vec<u8>) -> Vec<u8> {
        let mut translated = Vec::with_capacity(data.len());
        for byte in data {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    translated.push(b'\n');
                    continue;
                }
                translated.push(b'\r');
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                translated.push(byte);
            }
        }
        translated
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_plain_data_passes_through() {
        let mut parser = IacParser::new(true);
        let parsed = parser.feed(b"hello world");
        assert_eq!(parsed.data, b"hello world");
        assert!(parsed.reply.is_empty());
    }

    #[test]
    fn test_escaped_iac_is_data() {
        let mut parser = IacParser::new(true);
        let parsed = parser.feed(&[b'a', IAC, IAC, b'b']);
        assert_eq!(parsed.data, &[b'a', IAC, b'b']);
    }

    #[test]
    fn test_ayt_reply() {
        let mut parser = IacParser::new(true);
        let parsed = parser.feed(&[IAC, AYT]);
        assert!(parsed.data.is_empty());
        assert_eq!(
            parsed.reply,
            b"\r\nYour Are-You-There received. I am here.\r\n"
        );
    }

    #[test]
    fn test_do_unknown_option_refused() {
        let mut parser = IacParser::new(true);
        let parsed = parser.feed(&[IAC, DO, 42]);
        assert_eq!(parsed.reply, &[IAC, WONT, 42]);
    }

    #[test]
    fn test_do_sga_in_binary_mode() {
        let mut parser = IacParser::new(true);
        assert_eq!(parser.feed(&[IAC, DO, SGA]).reply, &[IAC, WILL, SGA]);

        let mut parser = IacParser::new(false);
        assert_eq!(parser.feed(&[IAC, DO, SGA]).reply, &[IAC, WONT, SGA]);
    }

    #[test]
    fn test_naws_window_size() {
        let mut parser = IacParser::new(true);
        let parsed = parser.feed(&[IAC, SB, NAWS, 0, 120, 0, 40, IAC, SE]);
        assert_eq!(parsed.window_size, Some((120, 40)));
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_sequence_split_across_feeds() {
        let mut parser = IacParser::new(true);
        assert_eq!(parser.feed(&[b'x', IAC]).data, b"x");
        assert_eq!(parser.feed(&[SB, NAWS, 0]).data, b"");
        let parsed = parser.feed(&[80, 0, 24, IAC, SE, b'y']);
        assert_eq!(parsed.window_size, Some((80, 24)));
        assert_eq!(parsed.data, b"y");
    }

    #[test]
    fn test_nop_is_dropped() {
        let mut parser = IacParser::new(true);
        let parsed = parser.feed(&[b'a', IAC, NOP, b'b']);
        assert_eq!(parsed.data, b"ab");
        assert!(parsed.reply.is_empty());
    }

    #[test]
    fn test_crlf_translation_when_not_binary() {
        let mut parser = IacParser::new(false);
        assert_eq!(parser.feed(b"a\r\nb").data, b"a\nb");

        // Split across chunks.
        assert_eq!(parser.feed(b"c\r").data, b"c");
        assert_eq!(parser.feed(b"\nd").data, b"\nd");

        // A lone carriage return is preserved.
        assert_eq!(parser.feed(b"e\r").data, b"e");
        assert_eq!(parser.feed(b"f").data, b"\rf");
    }

    #[test]
    fn test_binary_mode_preserves_crlf() {
        let mut parser = IacParser::new(true);
        assert_eq!(parser.feed(b"a\r\nb").data, b"a\r\nb");
    }
}
