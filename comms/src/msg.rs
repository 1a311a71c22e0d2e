use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

type Code = u16;
const CODE_SIZE: usize = size_of::<Code>();

const ERR_H: Header = 0;
const COMMAND_H: Header = 1;
const GET_H: Header = 2;
const SET_H: Header = 3;
const REPORT_H: Header = 4;
const PIPE_OPENED_H: Header = 5;
const PIPE_DATA_H: Header = 6;
const PIPE_CLOSE_H: Header = 7;

/// The command for the `Command` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Starts a chunked model upload of `size` bytes.
    SetModel { size: u32 },
    /// Runs the loaded model once on the current sample window.
    Predict,
    /// Drops the stored model and its cached arena hint.
    EraseModel,
}

/// The application layer message exchanged with a node.
///
/// Register and pipe payloads are raw little-endian bytes, their meaning is
/// given by the register code or the pipe they travel on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg<'a> {
    Err(Cow<'a, str>),
    Command(Command),
    Get(u16),
    Set(u16, Cow<'a, [u8]>),
    Report(u16, Cow<'a, [u8]>),
    PipeOpened(u16),
    PipeData(u16, Cow<'a, [u8]>),
    PipeClose(u16),
    /// A message of a kind this node doesn't know, or a command it can't decode.
    Unknown(u32),
}

impl Msg<'_> {
    /// Returns a short name of the message kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Err(_) => "err",
            Msg::Command(_) => "command",
            Msg::Get(_) => "get",
            Msg::Set(..) => "set",
            Msg::Report(..) => "report",
            Msg::PipeOpened(_) => "pipe/opened",
            Msg::PipeData(..) => "pipe/data",
            Msg::PipeClose(_) => "pipe/close",
            Msg::Unknown(_) => "unknown",
        }
    }

    /// Detaches the message from the buffer it was read from.
    pub fn into_owned(self) -> Msg<'static> {
        match self {
            Msg::Err(e) => Msg::Err(Cow::Owned(e.into_owned())),
            Msg::Command(cmd) => Msg::Command(cmd),
            Msg::Get(code) => Msg::Get(code),
            Msg::Set(code, value) => Msg::Set(code, Cow::Owned(value.into_owned())),
            Msg::Report(code, value) => Msg::Report(code, Cow::Owned(value.into_owned())),
            Msg::PipeOpened(port) => Msg::PipeOpened(port),
            Msg::PipeData(port, data) => Msg::PipeData(port, Cow::Owned(data.into_owned())),
            Msg::PipeClose(port) => Msg::PipeClose(port),
            Msg::Unknown(kind) => Msg::Unknown(kind),
        }
    }

    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn split_code(rest: &[u8]) -> io::Result<(Code, &[u8])> {
        let Some((code, tail)) = rest.split_first_chunk::<CODE_SIZE>() else {
            return Self::buf_is_too_small(rest.len(), CODE_SIZE);
        };

        Ok((Code::from_le_bytes(*code), tail))
    }
}

fn put_header(kind: Header, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&kind.to_be_bytes());
}

impl<'a> Serialize<'a> for Msg<'_> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                put_header(ERR_H, buf);
                Some(e.as_bytes())
            }
            Msg::Command(cmd) => {
                put_header(COMMAND_H, buf);

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Get(code) => {
                put_header(GET_H, buf);
                buf.extend_from_slice(&code.to_le_bytes());
                None
            }
            Msg::Set(code, value) => {
                put_header(SET_H, buf);
                buf.extend_from_slice(&code.to_le_bytes());
                Some(value.as_ref())
            }
            Msg::Report(code, value) => {
                put_header(REPORT_H, buf);
                buf.extend_from_slice(&code.to_le_bytes());
                Some(value.as_ref())
            }
            Msg::PipeOpened(port) => {
                put_header(PIPE_OPENED_H, buf);
                buf.extend_from_slice(&port.to_le_bytes());
                None
            }
            Msg::PipeData(port, data) => {
                put_header(PIPE_DATA_H, buf);
                buf.extend_from_slice(&port.to_le_bytes());
                Some(data.as_ref())
            }
            Msg::PipeClose(port) => {
                put_header(PIPE_CLOSE_H, buf);
                buf.extend_from_slice(&port.to_le_bytes());
                None
            }
            Msg::Unknown(kind) => {
                put_header(*kind, buf);
                None
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        };

        match Header::from_be_bytes(*kind) {
            ERR_H => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            // Commands this node doesn't know are not a broken stream.
            COMMAND_H => match serde_json::from_slice(rest) {
                Ok(cmd) => Ok(Self::Command(cmd)),
                Err(_) => Ok(Self::Unknown(COMMAND_H)),
            },
            GET_H => {
                let (code, _) = Self::split_code(rest)?;
                Ok(Self::Get(code))
            }
            SET_H => {
                let (code, value) = Self::split_code(rest)?;
                Ok(Self::Set(code, Cow::Borrowed(value)))
            }
            REPORT_H => {
                let (code, value) = Self::split_code(rest)?;
                Ok(Self::Report(code, Cow::Borrowed(value)))
            }
            PIPE_OPENED_H => {
                let (port, _) = Self::split_code(rest)?;
                Ok(Self::PipeOpened(port))
            }
            PIPE_DATA_H => {
                let (port, data) = Self::split_code(rest)?;
                Ok(Self::PipeData(port, Cow::Borrowed(data)))
            }
            PIPE_CLOSE_H => {
                let (port, _) = Self::split_code(rest)?;
                Ok(Self::PipeClose(port))
            }
            kind => Ok(Self::Unknown(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(msg: &Msg<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf).map(<[_]>::to_vec);
        buf.extend(tail.unwrap_or_default());
        buf
    }

    #[test]
    fn test_set_model_command_is_json() {
        let msg = Msg::Command(Command::SetModel { size: 4096 });
        let buf = body(&msg);

        assert_eq!(&buf[..HEADER_SIZE], &COMMAND_H.to_be_bytes());
        assert_eq!(&buf[HEADER_SIZE..], br#"{"set_model":{"size":4096}}"#);
        assert_eq!(Msg::deserialize(&buf).unwrap(), msg);
    }

    #[test]
    fn test_register_code_is_little_endian() {
        let msg = Msg::Report(0x185, Cow::Borrowed(&b"oops"[..]));
        let buf = body(&msg);

        assert_eq!(&buf[HEADER_SIZE..HEADER_SIZE + CODE_SIZE], &[0x85, 0x01]);
        assert_eq!(&buf[HEADER_SIZE + CODE_SIZE..], b"oops");
    }

    #[test]
    fn test_pipe_data_borrows_payload() {
        let buf = body(&Msg::PipeData(3, Cow::Owned(vec![1, 2, 3, 4])));

        let Msg::PipeData(port, Cow::Borrowed(data)) = Msg::deserialize(&buf).unwrap() else {
            panic!("expected borrowed pipe data");
        };

        assert_eq!(port, 3);
        assert_eq!(data, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_truncated_get_is_rejected() {
        let mut buf = GET_H.to_be_bytes().to_vec();
        buf.push(0x80);

        let err = Msg::deserialize(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_kind_decodes_as_unknown() {
        let mut buf = 42u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"whatever");

        assert_eq!(Msg::deserialize(&buf).unwrap(), Msg::Unknown(42));
    }

    #[test]
    fn test_unknown_command_decodes_as_unknown() {
        let mut buf = COMMAND_H.to_be_bytes().to_vec();
        buf.extend_from_slice(br#"{"calibrate":{}}"#);

        assert_eq!(Msg::deserialize(&buf).unwrap(), Msg::Unknown(COMMAND_H));
    }
}
