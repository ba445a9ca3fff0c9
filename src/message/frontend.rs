//! Frontend message serialization.
//!
//! All struct fields here mirror the actual message sent to the backend.
use bytes::{BufMut, BytesMut};

use super::Format;
use crate::ext::{BufMutExt, UsizeExt};

/// A type which can be encoded into a frontend message.
///
/// For historical reasons, the very first message sent by the client (the
/// startup message) has no initial message-type byte, so [`Startup`],
/// [`SslRequest`] and [`CancelRequest`] do not implement `FrontendMessage`
/// and write themselves directly.
pub trait FrontendMessage {
    /// Message type byte.
    const MSGTYPE: u8;

    /// Write the main body of the message.
    fn encode(&self, buf: &mut BytesMut);
}

/// Write a framed frontend message to `buf`.
///
/// The length field is back-patched after the body is written, so encoders
/// never have to predict their own size.
pub fn write<F: FrontendMessage>(msg: &F, buf: &mut BytesMut) {
    buf.put_u8(F::MSGTYPE);
    frame(buf, |buf| msg.encode(buf));
}

/// Reserve a length field, run `body`, then patch the length in.
pub fn frame(buf: &mut BytesMut, body: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_i32(0);

    body(buf);

    let len = (buf.len() - base).to_i32();
    buf[base..base + 4].copy_from_slice(&len.to_be_bytes());
}

/// The protocol version number: major 3, minor 0.
pub const PROTOCOL_VERSION: i32 = 196608;

/// The SSL request code: 1234 in the most significant 16 bits, 5679 in the
/// least significant.
const SSL_REQUEST_CODE: i32 = 80877103;

/// The cancel request code: 1234 in the most significant 16 bits, 5678 in
/// the least significant.
const CANCEL_REQUEST_CODE: i32 = 80877102;

/// The startup message. No message-type byte; the protocol version comes
/// first, followed by name/value pairs and a terminator.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Run-time parameters applied as session defaults at backend start.
    pub params: &'a [(String, String)],
}

impl Startup<'_> {
    pub fn write(&self, buf: &mut BytesMut) {
        frame(buf, |buf| {
            buf.put_i32(PROTOCOL_VERSION);

            buf.put_nul_str("user");
            buf.put_nul_str(self.user);

            if let Some(db) = self.database {
                buf.put_nul_str("database");
                buf.put_nul_str(db);
            }

            for (name, value) in self.params {
                buf.put_nul_str(name);
                buf.put_nul_str(value);
            }

            // terminator after the last name/value pair
            buf.put_u8(b'\0');
        });
    }
}

/// Asks the backend whether it is willing to perform a TLS handshake.
///
/// The reply is a single byte, not a framed message.
pub struct SslRequest;

impl SslRequest {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Out-of-band request to interrupt an in-flight query.
///
/// Sent as the only traffic on a dedicated socket; the backend never
/// replies to it.
#[derive(Debug)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// A password response (cleartext or md5-hashed, as requested).
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_str(self.password);
    }
}

/// Initial SASL response carrying the selected mechanism.
pub struct SaslInitialResponse<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_str(self.mechanism);
        buf.put_i32(self.data.len().to_i32());
        buf.put_slice(self.data);
    }
}

/// Continuation data for an in-progress SASL exchange.
pub struct SaslResponse<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// A simple query. May contain multiple statements.
pub struct Query<'a> {
    pub sql: &'a str,
}

impl FrontendMessage for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_str(self.sql);
    }
}

/// Creates a prepared statement from a textual query string.
pub struct Parse<'a> {
    /// Prepared statement name (empty selects the unnamed statement).
    pub name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Object IDs of parameter data types the frontend wants to prespecify.
    /// Zero leaves a type unspecified.
    pub param_oids: &'a [u32],
}

impl FrontendMessage for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_str(self.name);
        buf.put_nul_str(self.sql);
        buf.put_u16(self.param_oids.len().to_u16());
        for oid in self.param_oids {
            buf.put_u32(*oid);
        }
    }
}

/// Creates a portal from a prepared statement and parameter values.
pub struct Bind<'a> {
    /// Destination portal name (empty selects the unnamed portal).
    pub portal: &'a str,
    /// Source prepared statement name.
    pub statement: &'a str,
    /// Zero, one (applied to all), or one format per parameter.
    pub param_formats: &'a [Format],
    /// Raw parameter values; `None` is NULL (wire length -1).
    pub params: &'a [Option<&'a [u8]>],
    /// Zero, one (applied to all), or one format per result column.
    pub result_formats: &'a [Format],
}

impl FrontendMessage for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_str(self.portal);
        buf.put_nul_str(self.statement);

        buf.put_u16(self.param_formats.len().to_u16());
        for format in self.param_formats {
            buf.put_i16(format.code());
        }

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            match param {
                Some(value) => {
                    buf.put_i32(value.len().to_i32());
                    buf.put_slice(value);
                }
                None => buf.put_i32(-1),
            }
        }

        buf.put_u16(self.result_formats.len().to_u16());
        for format in self.result_formats {
            buf.put_i16(format.code());
        }
    }
}

/// Requests a description of a prepared statement (`'S'`) or portal (`'P'`).
pub struct Describe<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        buf.put_nul_str(self.name);
    }
}

/// Runs a portal's query. `max_rows` of zero denotes no limit.
pub struct Execute<'a> {
    pub portal: &'a str,
    pub max_rows: i32,
}

impl FrontendMessage for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_str(self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Closes a prepared statement (`'S'`) or portal (`'P'`).
pub struct Close<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        buf.put_nul_str(self.name);
    }
}

/// Closes the current extended-protocol cycle; the backend answers with
/// `ReadyForQuery`.
pub struct Sync;

impl FrontendMessage for Sync {
    const MSGTYPE: u8 = b'S';

    fn encode(&self, _: &mut BytesMut) { }
}

/// Graceful session termination. No reply follows.
pub struct Terminate;

impl FrontendMessage for Terminate {
    const MSGTYPE: u8 = b'X';

    fn encode(&self, _: &mut BytesMut) { }
}

/// One chunk of an outgoing COPY stream.
pub struct CopyData<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// Marks successful completion of an outgoing COPY stream.
pub struct CopyDone;

impl FrontendMessage for CopyDone {
    const MSGTYPE: u8 = b'c';

    fn encode(&self, _: &mut BytesMut) { }
}

/// Aborts an outgoing COPY stream; the message is reported by the backend
/// in the resulting error.
pub struct CopyFail<'a> {
    pub message: &'a str,
}

impl FrontendMessage for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_nul_str(self.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed<F: FrontendMessage>(msg: F) -> BytesMut {
        let mut buf = BytesMut::new();
        write(&msg, &mut buf);
        buf
    }

    #[test]
    fn query_frame() {
        let buf = framed(Query { sql: "SELECT 1" });

        let mut expected = BytesMut::new();
        expected.put_u8(b'Q');
        expected.put_i32(13);
        expected.put_slice(b"SELECT 1\0");

        assert_eq!(buf, expected);
    }

    #[test]
    fn parse_frame() {
        let buf = framed(Parse { name: "ps1", sql: "SELECT $1", param_oids: &[25] });

        let mut expected = BytesMut::new();
        expected.put_u8(b'P');
        expected.put_i32(4 + 4 + 10 + 2 + 4);
        expected.put_slice(b"ps1\0");
        expected.put_slice(b"SELECT $1\0");
        expected.put_u16(1);
        expected.put_u32(25);

        assert_eq!(buf, expected);
    }

    #[test]
    fn bind_frame() {
        let buf = framed(Bind {
            portal: "",
            statement: "ps1",
            param_formats: &[Format::Text],
            params: &[Some(b"hi"), None],
            result_formats: &[],
        });

        let mut expected = BytesMut::new();
        expected.put_u8(b'B');
        expected.put_i32(4 + 1 + 4 + 2 + 2 + 2 + 4 + 2 + 4 + 2);
        expected.put_slice(b"\0ps1\0");
        expected.put_u16(1);
        expected.put_i16(0);
        expected.put_u16(2);
        expected.put_i32(2);
        expected.put_slice(b"hi");
        expected.put_i32(-1);
        expected.put_u16(0);

        assert_eq!(buf, expected);
    }

    #[test]
    fn describe_and_execute_frames() {
        let buf = framed(Describe { kind: b'S', name: "ps1" });
        let mut expected = BytesMut::new();
        expected.put_u8(b'D');
        expected.put_i32(9);
        expected.put_u8(b'S');
        expected.put_slice(b"ps1\0");
        assert_eq!(buf, expected);

        let buf = framed(Execute { portal: "", max_rows: 0 });
        let mut expected = BytesMut::new();
        expected.put_u8(b'E');
        expected.put_i32(9);
        expected.put_u8(0);
        expected.put_i32(0);
        assert_eq!(buf, expected);
    }

    #[test]
    fn zero_body_frames() {
        for (buf, ty) in [(framed(Sync), b'S'), (framed(Terminate), b'X'), (framed(CopyDone), b'c')] {
            let mut expected = BytesMut::new();
            expected.put_u8(ty);
            expected.put_i32(4);
            assert_eq!(buf, expected);
        }
    }

    #[test]
    fn cancel_request_frame() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 42, secret_key: 7 }.write(&mut buf);

        let mut expected = BytesMut::new();
        expected.put_i32(16);
        expected.put_i32(80877102);
        expected.put_i32(42);
        expected.put_i32(7);

        assert_eq!(buf, expected);
    }

    #[test]
    fn ssl_request_frame() {
        let mut buf = BytesMut::new();
        SslRequest.write(&mut buf);
        assert_eq!(buf.as_ref(), &[0, 0, 0, 8, 4, 210, 22, 47][..]);
    }

    #[test]
    fn close_frame() {
        let buf = framed(Close { kind: b'S', name: "ps1" });
        let mut expected = BytesMut::new();
        expected.put_u8(b'C');
        expected.put_i32(9);
        expected.put_u8(b'S');
        expected.put_slice(b"ps1\0");
        assert_eq!(buf, expected);
    }

    #[test]
    fn sasl_initial_response_frame() {
        let buf = framed(SaslInitialResponse { mechanism: "SCRAM-SHA-256", data: b"n,," });
        let mut expected = BytesMut::new();
        expected.put_u8(b'p');
        expected.put_i32(4 + 14 + 4 + 3);
        expected.put_slice(b"SCRAM-SHA-256\0");
        expected.put_i32(3);
        expected.put_slice(b"n,,");
        assert_eq!(buf, expected);
    }

    #[test]
    fn startup_frame() {
        let params = vec![("application_name".to_string(), "postwire".to_string())];
        let mut buf = BytesMut::new();
        Startup { user: "alice", database: Some("db"), params: &params }.write(&mut buf);

        let mut expected = BytesMut::new();
        expected.put_i32(4 + 4 + 11 + 12 + 17 + 9 + 1);
        expected.put_i32(196608);
        expected.put_slice(b"user\0alice\0");
        expected.put_slice(b"database\0db\0");
        expected.put_slice(b"application_name\0postwire\0");
        expected.put_u8(0);

        assert_eq!(buf, expected);
    }

    #[test]
    fn copy_fail_frame() {
        let buf = framed(CopyFail { message: "boom" });
        let mut expected = BytesMut::new();
        expected.put_u8(b'f');
        expected.put_i32(9);
        expected.put_slice(b"boom\0");
        assert_eq!(buf, expected);
    }
}
