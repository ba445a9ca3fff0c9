//! Backend message decoding.
use bytes::{Buf, Bytes};

use super::{error::ProtocolError, Format};
use crate::{
    error::PgError,
    ext::BytesExt,
    statement::CommandTag,
};

/// Object ID of a data type.
pub type Oid = u32;

/// Every backend message this driver recognizes, decoded.
///
/// The union is closed: an unlisted message type is a protocol error, not
/// an extension point.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData { process_id: i32, secret_key: i32 },
    BindComplete,
    CloseComplete,
    CommandComplete(CommandTag),
    CopyData(Bytes),
    CopyDone,
    CopyInResponse(CopyResponse),
    CopyOutResponse(CopyResponse),
    DataRow(Vec<Option<Bytes>>),
    EmptyQueryResponse,
    ErrorResponse(Box<PgError>),
    NoData,
    NoticeResponse(Box<PgError>),
    NotificationResponse(Notification),
    ParameterDescription(Vec<Oid>),
    ParameterStatus { name: String, value: String },
    ParseComplete,
    PortalSuspended,
    ReadyForQuery(u8),
    RowDescription(Vec<FieldDescription>),
}

impl BackendMessage {
    /// Decode one framed message body.
    pub fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let message = match msgtype {
            b'R' => Self::Authentication(Authentication::decode(body)?),
            b'K' => {
                check_len(&body, 8, "BackendKeyData")?;
                Self::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                }
            }
            b'2' => Self::BindComplete,
            b'3' => Self::CloseComplete,
            b'C' => {
                let tag = body
                    .get_nul_string()
                    .ok_or(ProtocolError::Malformed("CommandComplete"))?;
                Self::CommandComplete(CommandTag::new(tag))
            }
            b'd' => Self::CopyData(body),
            b'c' => Self::CopyDone,
            b'G' => Self::CopyInResponse(CopyResponse::decode(body)?),
            b'H' => Self::CopyOutResponse(CopyResponse::decode(body)?),
            b'D' => {
                check_len(&body, 2, "DataRow")?;
                let len = body.get_u16() as usize;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    check_len(&body, 4, "DataRow")?;
                    match body.get_i32() {
                        -1 => values.push(None),
                        n if n >= 0 && body.remaining() >= n as usize => {
                            values.push(Some(body.split_to(n as usize)));
                        }
                        _ => return Err(ProtocolError::Malformed("DataRow")),
                    }
                }
                Self::DataRow(values)
            }
            b'I' => Self::EmptyQueryResponse,
            b'E' => Self::ErrorResponse(Box::new(PgError::parse(body))),
            b'n' => Self::NoData,
            b'N' => Self::NoticeResponse(Box::new(PgError::parse(body))),
            b'A' => {
                check_len(&body, 4, "NotificationResponse")?;
                let process_id = body.get_i32();
                let channel = body
                    .get_nul_string()
                    .ok_or(ProtocolError::Malformed("NotificationResponse"))?;
                let payload = body
                    .get_nul_string()
                    .ok_or(ProtocolError::Malformed("NotificationResponse"))?;
                Self::NotificationResponse(Notification { process_id, channel, payload })
            }
            b't' => {
                check_len(&body, 2, "ParameterDescription")?;
                let len = body.get_u16() as usize;
                check_len(&body, len * 4, "ParameterDescription")?;
                Self::ParameterDescription((0..len).map(|_| body.get_u32()).collect())
            }
            b'S' => {
                let name = body
                    .get_nul_string()
                    .ok_or(ProtocolError::Malformed("ParameterStatus"))?;
                let value = body
                    .get_nul_string()
                    .ok_or(ProtocolError::Malformed("ParameterStatus"))?;
                Self::ParameterStatus { name, value }
            }
            b'1' => Self::ParseComplete,
            b's' => Self::PortalSuspended,
            b'Z' => {
                check_len(&body, 1, "ReadyForQuery")?;
                Self::ReadyForQuery(body.get_u8())
            }
            b'T' => {
                check_len(&body, 2, "RowDescription")?;
                let len = body.get_u16() as usize;
                let mut fields = Vec::with_capacity(len);
                for _ in 0..len {
                    fields.push(FieldDescription::decode(&mut body)?);
                }
                Self::RowDescription(fields)
            }
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(message)
    }

    /// Short tag for trace logging.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "Authentication",
            Self::BackendKeyData { .. } => "BackendKeyData",
            Self::BindComplete => "BindComplete",
            Self::CloseComplete => "CloseComplete",
            Self::CommandComplete(_) => "CommandComplete",
            Self::CopyData(_) => "CopyData",
            Self::CopyDone => "CopyDone",
            Self::CopyInResponse(_) => "CopyInResponse",
            Self::CopyOutResponse(_) => "CopyOutResponse",
            Self::DataRow(_) => "DataRow",
            Self::EmptyQueryResponse => "EmptyQueryResponse",
            Self::ErrorResponse(_) => "ErrorResponse",
            Self::NoData => "NoData",
            Self::NoticeResponse(_) => "NoticeResponse",
            Self::NotificationResponse(_) => "NotificationResponse",
            Self::ParameterDescription(_) => "ParameterDescription",
            Self::ParameterStatus { .. } => "ParameterStatus",
            Self::ParseComplete => "ParseComplete",
            Self::PortalSuspended => "PortalSuspended",
            Self::ReadyForQuery(_) => "ReadyForQuery",
            Self::RowDescription(_) => "RowDescription",
        }
    }
}

fn check_len(body: &Bytes, at_least: usize, what: &'static str) -> Result<(), ProtocolError> {
    if body.remaining() < at_least {
        return Err(ProtocolError::Malformed(what));
    }
    Ok(())
}

/// An authentication request. The body starts with a code selecting the
/// scheme; SASL variants carry additional exchange data.
#[derive(Debug)]
pub enum Authentication {
    /// Authentication was successful.
    Ok,
    /// A clear-text password is required.
    CleartextPassword,
    /// An MD5-encrypted password is required, mixed with the given salt.
    Md5Password { salt: [u8; 4] },
    /// SASL authentication is required; the body lists mechanism names in
    /// the server's order of preference.
    Sasl { mechanisms: Vec<String> },
    /// Challenge data of an in-progress SASL exchange.
    SaslContinue { data: Bytes },
    /// Final SASL data (the server signature for SCRAM).
    SaslFinal { data: Bytes },
}

impl Authentication {
    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.remaining() < 4 {
            return Err(ProtocolError::Malformed("Authentication"));
        }
        let auth = match body.get_i32() {
            0 => Self::Ok,
            3 => Self::CleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                check_len(&body, 4, "AuthenticationMD5Password")?;
                body.copy_to_slice(&mut salt);
                Self::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while let Some(name) = body.get_nul_string() {
                    if name.is_empty() {
                        break;
                    }
                    mechanisms.push(name);
                }
                Self::Sasl { mechanisms }
            }
            11 => Self::SaslContinue { data: body },
            12 => Self::SaslFinal { data: body },
            code => return Err(ProtocolError::UnknownAuth(code)),
        };
        Ok(auth)
    }
}

/// One column of a `RowDescription`.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    /// The field name.
    pub name: String,
    /// Object ID of the source table, or zero.
    pub table_oid: Oid,
    /// Attribute number of the source column, or zero.
    pub column_attr_number: i16,
    /// Object ID of the field's data type.
    pub data_type_oid: Oid,
    /// The data type size; negative values denote variable-width types.
    pub data_type_size: i16,
    /// The type modifier; meaning is type-specific.
    pub type_modifier: i32,
    /// Format the values of this column are transmitted in.
    pub format: Format,
}

impl FieldDescription {
    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let name = body
            .get_nul_string()
            .ok_or(ProtocolError::Malformed("RowDescription"))?;
        check_len(body, 18, "RowDescription")?;
        Ok(Self {
            name,
            table_oid: body.get_u32(),
            column_attr_number: body.get_i16(),
            data_type_oid: body.get_u32(),
            data_type_size: body.get_i16(),
            type_modifier: body.get_i32(),
            format: Format::from_code(body.get_i16()),
        })
    }
}

/// Header of a `CopyInResponse` / `CopyOutResponse`.
#[derive(Debug)]
pub struct CopyResponse {
    /// 0 for textual copy, 1 for binary.
    pub overall_format: i8,
    /// Per-column format codes.
    pub column_formats: Vec<i16>,
}

impl CopyResponse {
    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        check_len(&body, 3, "CopyResponse")?;
        let overall_format = body.get_i8();
        let len = body.get_u16() as usize;
        check_len(&body, len * 2, "CopyResponse")?;
        Ok(Self {
            overall_format,
            column_formats: (0..len).map(|_| body.get_i16()).collect(),
        })
    }
}

/// An asynchronous `LISTEN`/`NOTIFY` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Process ID of the notifying backend.
    pub process_id: i32,
    /// Name of the channel.
    pub channel: String,
    /// The notification payload, empty when none was given.
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn decode(msgtype: u8, body: &[u8]) -> BackendMessage {
        BackendMessage::decode(msgtype, Bytes::copy_from_slice(body)).unwrap()
    }

    #[test]
    fn ready_for_query() {
        let BackendMessage::ReadyForQuery(status) = decode(b'Z', b"I") else {
            panic!("wrong variant");
        };
        assert_eq!(status, b'I');
    }

    #[test]
    fn data_row_with_null() {
        let mut body = BytesMut::new();
        body.put_u16(2);
        body.put_i32(2);
        body.put_slice(b"42");
        body.put_i32(-1);

        let BackendMessage::DataRow(values) = decode(b'D', &body) else {
            panic!("wrong variant");
        };
        assert_eq!(values[0].as_deref(), Some(&b"42"[..]));
        assert_eq!(values[1], None);
    }

    #[test]
    fn row_description() {
        let mut body = BytesMut::new();
        body.put_u16(1);
        body.put_slice(b"msg\0");
        body.put_u32(0);
        body.put_i16(0);
        body.put_u32(25);
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0);

        let BackendMessage::RowDescription(fields) = decode(b'T', &body) else {
            panic!("wrong variant");
        };
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "msg");
        assert_eq!(fields[0].data_type_oid, 25);
        assert_eq!(fields[0].format, Format::Text);
    }

    #[test]
    fn notification() {
        let mut body = BytesMut::new();
        body.put_i32(99);
        body.put_slice(b"foo\0bar\0");

        let BackendMessage::NotificationResponse(n) = decode(b'A', &body) else {
            panic!("wrong variant");
        };
        assert_eq!(n, Notification { process_id: 99, channel: "foo".into(), payload: "bar".into() });
    }

    #[test]
    fn sasl_mechanisms() {
        let mut body = BytesMut::new();
        body.put_i32(10);
        body.put_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");

        let BackendMessage::Authentication(Authentication::Sasl { mechanisms }) =
            decode(b'R', &body)
        else {
            panic!("wrong variant");
        };
        assert_eq!(mechanisms, ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
    }

    #[test]
    fn md5_salt() {
        let mut body = BytesMut::new();
        body.put_i32(5);
        body.put_slice(&[1, 2, 3, 4]);

        let BackendMessage::Authentication(Authentication::Md5Password { salt }) =
            decode(b'R', &body)
        else {
            panic!("wrong variant");
        };
        assert_eq!(salt, [1, 2, 3, 4]);
    }

    #[test]
    fn unknown_message_type_is_protocol_error() {
        let err = BackendMessage::decode(b'!', Bytes::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(b'!')));
    }

    #[test]
    fn error_response_fields() {
        let body = b"SERROR\0VERROR\0C22012\0Mdivision by zero\0P8\0\0";
        let BackendMessage::ErrorResponse(err) = decode(b'E', body) else {
            panic!("wrong variant");
        };
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "22012");
        assert_eq!(err.message, "division by zero");
        assert_eq!(err.position, Some(8));
    }
}
