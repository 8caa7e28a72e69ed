//! SFTP Protocol Implementation
//!
//! Wire format of the SSH File Transfer Protocol version 3
//! (draft-ietf-secsh-filexfer-02), the version spoken by every mainstream
//! client. Framing (the 4-byte length prefix) is handled by the session
//! engine; everything here works on a single packet body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use owlfs_core::{Metadata, NodeKind, OpenOptions, SetAttrs};
use std::time::{Duration, SystemTime};

/// SFTP Protocol Version
pub const SFTP_VERSION: u32 = 3;

/// SFTP message types (as defined in the SFTP specification)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initialize SFTP session
    Init = 1,
    /// Version response
    Version = 2,
    /// Open file
    Open = 3,
    /// Close file
    Close = 4,
    /// Read from file
    Read = 5,
    /// Write to file
    Write = 6,
    /// Get file attributes by path
    Lstat = 7,
    /// Get file attributes by handle
    Fstat = 8,
    /// Set file attributes by path
    Setstat = 9,
    /// Set file attributes by handle
    Fsetstat = 10,
    /// Open directory
    Opendir = 11,
    /// Read directory entries
    Readdir = 12,
    /// Remove file
    Remove = 13,
    /// Create directory
    Mkdir = 14,
    /// Remove directory
    Rmdir = 15,
    /// Get real path
    Realpath = 16,
    /// Get file attributes by path (follow symlinks)
    Stat = 17,
    /// Rename file or directory
    Rename = 18,
    /// Read symbolic link
    Readlink = 19,
    /// Create symbolic link
    Symlink = 20,
    /// Status response
    Status = 101,
    /// Handle response
    Handle = 102,
    /// Data response
    Data = 103,
    /// Name response (for directory listings)
    Name = 104,
    /// Attributes response
    Attrs = 105,
    /// Extended request
    Extended = 200,
    /// Extended reply
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Version),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Close),
            5 => Ok(MessageType::Read),
            6 => Ok(MessageType::Write),
            7 => Ok(MessageType::Lstat),
            8 => Ok(MessageType::Fstat),
            9 => Ok(MessageType::Setstat),
            10 => Ok(MessageType::Fsetstat),
            11 => Ok(MessageType::Opendir),
            12 => Ok(MessageType::Readdir),
            13 => Ok(MessageType::Remove),
            14 => Ok(MessageType::Mkdir),
            15 => Ok(MessageType::Rmdir),
            16 => Ok(MessageType::Realpath),
            17 => Ok(MessageType::Stat),
            18 => Ok(MessageType::Rename),
            19 => Ok(MessageType::Readlink),
            20 => Ok(MessageType::Symlink),
            101 => Ok(MessageType::Status),
            102 => Ok(MessageType::Handle),
            103 => Ok(MessageType::Data),
            104 => Ok(MessageType::Name),
            105 => Ok(MessageType::Attrs),
            200 => Ok(MessageType::Extended),
            201 => Ok(MessageType::ExtendedReply),
            _ => Err(crate::Error::Protocol(format!(
                "Unknown message type: {}",
                value
            ))),
        }
    }
}

/// SFTP Status codes (RFC draft-ietf-secsh-filexfer)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file
    Eof = 1,
    /// No such file or directory
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// General failure
    Failure = 4,
    /// Bad message
    BadMessage = 5,
    /// No connection
    NoConnection = 6,
    /// Connection lost
    ConnectionLost = 7,
    /// Operation not supported
    OpUnsupported = 8,
    /// Unknown or closed handle (SSH_FX_INVALID_HANDLE from later drafts)
    InvalidHandle = 9,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for StatusCode {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Eof),
            2 => Ok(StatusCode::NoSuchFile),
            3 => Ok(StatusCode::PermissionDenied),
            4 => Ok(StatusCode::Failure),
            5 => Ok(StatusCode::BadMessage),
            6 => Ok(StatusCode::NoConnection),
            7 => Ok(StatusCode::ConnectionLost),
            8 => Ok(StatusCode::OpUnsupported),
            9 => Ok(StatusCode::InvalidHandle),
            _ => Err(crate::Error::Protocol(format!("Unknown status code: {value}"))),
        }
    }
}

/// File open flags (as defined in SFTP spec)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x00000001;
    pub const WRITE: u32 = 0x00000002;
    pub const APPEND: u32 = 0x00000004;
    pub const CREAT: u32 = 0x00000008;
    pub const TRUNC: u32 = 0x00000010;
    pub const EXCL: u32 = 0x00000020;

    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }

    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }

    /// Translate to VFS open options
    pub fn to_options(self) -> OpenOptions {
        OpenOptions {
            read: self.has_read(),
            write: self.has_write(),
            append: self.has_append(),
            create: self.has_creat(),
            truncate: self.has_trunc(),
            exclusive: self.has_excl(),
        }
    }
}

/// File type bits carried in the permissions field
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;

/// File attributes (as defined in SFTP spec)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x00000001;
    const FLAG_UIDGID: u32 = 0x00000002;
    const FLAG_PERMISSIONS: u32 = 0x00000004;
    const FLAG_ACMODTIME: u32 = 0x00000008;
    const FLAG_EXTENDED: u32 = 0x80000000;

    /// Append the attribute block to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
    }

    /// Decode file attributes from bytes
    ///
    /// Extended attribute pairs are parsed and discarded.
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        let flags = codec::get_u32(buf)?;
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(codec::get_u64(buf)?);
        }
        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid = Some(codec::get_u32(buf)?);
            attrs.gid = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime = Some(codec::get_u32(buf)?);
            attrs.mtime = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_EXTENDED != 0 {
            let count = codec::get_u32(buf)?;
            for _ in 0..count {
                codec::get_bytes(buf)?;
                codec::get_bytes(buf)?;
            }
        }

        Ok(attrs)
    }

    /// Attributes reported for VFS metadata
    pub fn from_metadata(meta: &Metadata) -> Self {
        let type_bits = match meta.kind {
            NodeKind::Directory => S_IFDIR,
            NodeKind::File => S_IFREG,
        };
        let mtime = u32::try_from(meta.modified_secs()).unwrap_or(u32::MAX);
        Self {
            size: Some(meta.size),
            uid: None,
            gid: None,
            permissions: Some(type_bits | (meta.permissions & 0o7777)),
            atime: Some(mtime),
            mtime: Some(mtime),
        }
    }

    /// The subset of attributes a VFS can apply; ownership is ignored
    pub fn to_set_attrs(&self) -> SetAttrs {
        SetAttrs {
            size: self.size,
            permissions: self.permissions.map(|p| p & 0o7777),
            modified: self
                .mtime
                .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(u64::from(secs))),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.permissions.is_some_and(|p| p & 0o170000 == S_IFDIR)
    }
}

/// `ls -l` style line used as the SFTP long name of a directory entry
pub fn long_name(name: &str, meta: &Metadata) -> String {
    const OWNER: &str = "owlfs";
    const RWX: [&str; 8] = ["---", "--x", "-w-", "-wx", "r--", "r-x", "rw-", "rwx"];

    let kind = if meta.is_dir() { 'd' } else { '-' };
    let perms = meta.permissions & 0o777;
    let mode = format!(
        "{kind}{}{}{}",
        RWX[(perms >> 6) as usize & 7],
        RWX[(perms >> 3) as usize & 7],
        RWX[perms as usize & 7]
    );

    let modified: DateTime<Utc> = meta.modified.into();
    let six_months = chrono::Duration::days(182);
    let date = if Utc::now().signed_duration_since(modified) > six_months {
        modified.format("%b %e  %Y")
    } else {
        modified.format("%b %e %H:%M")
    };

    format!(
        "{mode}    1 {OWNER:<8} {OWNER:<8} {size:>8} {date} {name}",
        size = meta.size
    )
}

/// A decoded client packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// SSH_FXP_INIT, the only packet without a request id
    Init { version: u32 },
    Request { id: u32, request: Request },
    /// The request id was readable but the body was not
    Malformed { id: u32, reason: String },
}

/// One SFTP operation, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open {
        path: String,
        flags: OpenFlags,
        attrs: FileAttrs,
    },
    Close {
        handle: Vec<u8>,
    },
    Read {
        handle: Vec<u8>,
        offset: u64,
        len: u32,
    },
    Write {
        handle: Vec<u8>,
        offset: u64,
        data: Bytes,
    },
    Lstat {
        path: String,
    },
    Fstat {
        handle: Vec<u8>,
    },
    Setstat {
        path: String,
        attrs: FileAttrs,
    },
    Fsetstat {
        handle: Vec<u8>,
        attrs: FileAttrs,
    },
    Opendir {
        path: String,
    },
    Readdir {
        handle: Vec<u8>,
    },
    Remove {
        path: String,
    },
    Mkdir {
        path: String,
        attrs: FileAttrs,
    },
    Rmdir {
        path: String,
    },
    Realpath {
        path: String,
    },
    Stat {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Readlink {
        path: String,
    },
    /// OpenSSH sends the target first, then the link path
    Symlink {
        target: String,
        link: String,
    },
    Extended {
        name: String,
    },
    /// A message type that is not a client request
    Unsupported {
        kind: u8,
    },
}

impl Request {
    /// The handle this request operates on, if any
    pub fn handle(&self) -> Option<&[u8]> {
        match self {
            Request::Close { handle }
            | Request::Read { handle, .. }
            | Request::Write { handle, .. }
            | Request::Fstat { handle }
            | Request::Fsetstat { handle, .. }
            | Request::Readdir { handle } => Some(handle),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Open { .. } => "open",
            Request::Close { .. } => "close",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Lstat { .. } => "lstat",
            Request::Fstat { .. } => "fstat",
            Request::Setstat { .. } => "setstat",
            Request::Fsetstat { .. } => "fsetstat",
            Request::Opendir { .. } => "opendir",
            Request::Readdir { .. } => "readdir",
            Request::Remove { .. } => "remove",
            Request::Mkdir { .. } => "mkdir",
            Request::Rmdir { .. } => "rmdir",
            Request::Realpath { .. } => "realpath",
            Request::Stat { .. } => "stat",
            Request::Rename { .. } => "rename",
            Request::Readlink { .. } => "readlink",
            Request::Symlink { .. } => "symlink",
            Request::Extended { .. } => "extended",
            Request::Unsupported { .. } => "unsupported",
        }
    }

    fn decode_body(kind: u8, buf: &mut &[u8]) -> crate::Result<Self> {
        use codec::{get_bytes, get_string, get_u32, get_u64};

        let kind = match MessageType::try_from(kind) {
            Ok(kind) => kind,
            Err(_) => return Ok(Request::Unsupported { kind }),
        };

        let request = match kind {
            MessageType::Open => Request::Open {
                path: get_string(buf)?,
                flags: OpenFlags(get_u32(buf)?),
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Close => Request::Close {
                handle: get_bytes(buf)?,
            },
            MessageType::Read => Request::Read {
                handle: get_bytes(buf)?,
                offset: get_u64(buf)?,
                len: get_u32(buf)?,
            },
            MessageType::Write => Request::Write {
                handle: get_bytes(buf)?,
                offset: get_u64(buf)?,
                data: Bytes::from(get_bytes(buf)?),
            },
            MessageType::Lstat => Request::Lstat {
                path: get_string(buf)?,
            },
            MessageType::Fstat => Request::Fstat {
                handle: get_bytes(buf)?,
            },
            MessageType::Setstat => Request::Setstat {
                path: get_string(buf)?,
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Fsetstat => Request::Fsetstat {
                handle: get_bytes(buf)?,
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Opendir => Request::Opendir {
                path: get_string(buf)?,
            },
            MessageType::Readdir => Request::Readdir {
                handle: get_bytes(buf)?,
            },
            MessageType::Remove => Request::Remove {
                path: get_string(buf)?,
            },
            MessageType::Mkdir => Request::Mkdir {
                path: get_string(buf)?,
                // Some clients omit the attrs entirely
                attrs: if buf.has_remaining() {
                    FileAttrs::decode(buf)?
                } else {
                    FileAttrs::default()
                },
            },
            MessageType::Rmdir => Request::Rmdir {
                path: get_string(buf)?,
            },
            MessageType::Realpath => Request::Realpath {
                path: get_string(buf)?,
            },
            MessageType::Stat => Request::Stat {
                path: get_string(buf)?,
            },
            MessageType::Rename => Request::Rename {
                from: get_string(buf)?,
                to: get_string(buf)?,
            },
            MessageType::Readlink => Request::Readlink {
                path: get_string(buf)?,
            },
            MessageType::Symlink => Request::Symlink {
                target: get_string(buf)?,
                link: get_string(buf)?,
            },
            MessageType::Extended => Request::Extended {
                name: get_string(buf)?,
            },
            other => Request::Unsupported { kind: other as u8 },
        };
        Ok(request)
    }
}

impl Incoming {
    /// Decode one packet body (without the length prefix)
    ///
    /// Fails only when not even the type and request id can be read.
    pub fn decode(packet: &[u8]) -> crate::Result<Self> {
        let mut buf = packet;
        if !buf.has_remaining() {
            return Err(crate::Error::Protocol("Empty packet".into()));
        }
        let kind = buf.get_u8();

        if kind == MessageType::Init as u8 {
            return Ok(Incoming::Init {
                version: codec::get_u32(&mut buf)?,
            });
        }

        let id = codec::get_u32(&mut buf)?;
        match Request::decode_body(kind, &mut buf) {
            Ok(request) => Ok(Incoming::Request { id, request }),
            Err(e) => Ok(Incoming::Malformed {
                id,
                reason: e.to_string(),
            }),
        }
    }
}

/// One entry of an SSH_FXP_NAME response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttrs,
}

/// A server packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version { version: u32 },
    Status { code: StatusCode, message: String },
    Handle(Vec<u8>),
    Data(Bytes),
    Name(Vec<NameEntry>),
    Attrs(FileAttrs),
}

impl Response {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Response::Status {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::status(StatusCode::Ok, "Success")
    }

    /// Encode the packet body for request `id`; `Version` carries no id
    pub fn encode(&self, id: u32) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Response::Version { version } => {
                buf.put_u8(MessageType::Version as u8);
                buf.put_u32(*version);
            }
            Response::Status { code, message } => {
                buf.put_u8(MessageType::Status as u8);
                buf.put_u32(id);
                buf.put_u32(*code as u32);
                codec::put_string(&mut buf, message);
                codec::put_string(&mut buf, "");
            }
            Response::Handle(handle) => {
                buf.put_u8(MessageType::Handle as u8);
                buf.put_u32(id);
                codec::put_bytes(&mut buf, handle);
            }
            Response::Data(data) => {
                buf.put_u8(MessageType::Data as u8);
                buf.put_u32(id);
                codec::put_bytes(&mut buf, data);
            }
            Response::Name(entries) => {
                buf.put_u8(MessageType::Name as u8);
                buf.put_u32(id);
                buf.put_u32(entries.len() as u32);
                for entry in entries {
                    codec::put_string(&mut buf, &entry.filename);
                    codec::put_string(&mut buf, &entry.longname);
                    entry.attrs.encode_into(&mut buf);
                }
            }
            Response::Attrs(attrs) => {
                buf.put_u8(MessageType::Attrs as u8);
                buf.put_u32(id);
                attrs.encode_into(&mut buf);
            }
        }
        buf.freeze()
    }
}

/// Helper functions for encoding/decoding SFTP protocol strings
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    pub fn get_u32(buf: &mut &[u8]) -> crate::Result<u32> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol("Insufficient data for u32".into()));
        }
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8]) -> crate::Result<u64> {
        if buf.remaining() < 8 {
            return Err(crate::Error::Protocol("Insufficient data for u64".into()));
        }
        Ok(buf.get_u64())
    }

    /// Encode a string as SFTP string (length + data)
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    /// Decode an SFTP string
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::Protocol(format!("Invalid UTF-8 string: {}", e)))
    }

    /// Encode bytes as SFTP string (length + data)
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    /// Decode SFTP bytes
    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(crate::Error::Protocol("Insufficient data for bytes".into()));
        }

        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }
}
