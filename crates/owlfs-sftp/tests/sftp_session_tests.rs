//! SFTP session tests
//!
//! Drive [`owlfs_sftp::SftpSession`] over an in-memory pipe with a minimal
//! SFTP v3 client, covering request semantics, handle lifetime, pipelining
//! and session teardown.

mod common;

use bytes::{BufMut, Bytes, BytesMut};
use common::{Reply, TestClient, TrackingFs, write_body};
use owlfs_core::{MemoryFs, Vfs, VfsPath};
use owlfs_sftp::SessionLimits;
use owlfs_sftp::protocol::{MessageType, OpenFlags, StatusCode, codec};
use std::collections::HashSet;
use std::sync::Arc;

const CREATE: u32 = OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC;

fn limits(max_open_handles: usize, readdir_batch_size: usize) -> SessionLimits {
    SessionLimits {
        max_open_handles,
        readdir_batch_size,
        ..SessionLimits::default()
    }
}

/// Upload then download a small file
#[tokio::test]
async fn test_write_then_read_round_trip() {
    let (mut client, fs) = TestClient::connect_memory().await;

    client.put_file("/a.txt", b"hello").await;
    assert_eq!(client.get_file("/a.txt").await, b"hello");

    let meta = fs.stat(&VfsPath::parse("/a.txt").unwrap()).await.unwrap();
    assert_eq!(meta.size, 5);

    client.finish().await.unwrap();
}

/// Reading past the end answers EOF rather than empty data
#[tokio::test]
async fn test_read_at_end_is_eof() {
    let (mut client, _fs) = TestClient::connect_memory().await;
    client.put_file("/a.txt", b"hello").await;

    let handle = client.open_handle("/a.txt", OpenFlags::READ).await;
    assert_eq!(client.read(&handle, 2, 100).await, Reply::Data(b"llo".to_vec()));
    assert_eq!(client.read(&handle, 5, 100).await.status(), Some(StatusCode::Eof));
    assert_eq!(client.close(&handle).await.status(), Some(StatusCode::Ok));

    client.finish().await.unwrap();
}

/// Open with neither READ nor WRITE falls back to read access
#[tokio::test]
async fn test_open_without_access_flags_reads() {
    let (mut client, _fs) = TestClient::connect_memory().await;
    client.put_file("/a.txt", b"data").await;

    let handle = client.open_handle("/a.txt", 0).await;
    assert_eq!(client.read(&handle, 0, 10).await, Reply::Data(b"data".to_vec()));

    client.finish().await.unwrap();
}

/// A closed handle is gone for every later request
#[tokio::test]
async fn test_closed_handle_is_invalid() {
    let (mut client, _fs) = TestClient::connect_memory().await;
    let handle = client.open_handle("/a.txt", CREATE).await;

    assert_eq!(client.close(&handle).await.status(), Some(StatusCode::Ok));
    assert_eq!(
        client.read(&handle, 0, 10).await.status(),
        Some(StatusCode::InvalidHandle)
    );
    assert_eq!(
        client.close(&handle).await.status(),
        Some(StatusCode::InvalidHandle)
    );
    assert_eq!(
        client.read(b"garbage", 0, 10).await.status(),
        Some(StatusCode::InvalidHandle)
    );

    client.finish().await.unwrap();
}

/// Handles issued by one session mean nothing to another
#[tokio::test]
async fn test_handles_are_scoped_to_their_session() {
    let fs = Arc::new(MemoryFs::new());
    let mut first = TestClient::connect(fs.clone(), SessionLimits::default()).await;
    let mut second = TestClient::connect(fs.clone(), SessionLimits::default()).await;

    first.put_file("/shared.txt", b"shared").await;
    let handle = first.open_handle("/shared.txt", OpenFlags::READ).await;

    assert_eq!(
        second.read(&handle, 0, 10).await.status(),
        Some(StatusCode::InvalidHandle)
    );
    assert_eq!(first.read(&handle, 0, 10).await, Reply::Data(b"shared".to_vec()));

    first.finish().await.unwrap();
    second.finish().await.unwrap();
}

/// Directory listings arrive in batches, each entry exactly once
#[tokio::test]
async fn test_readdir_batches_every_entry_once() {
    let fs = Arc::new(MemoryFs::new());
    let mut client = TestClient::connect(fs.clone(), limits(16, 3)).await;

    assert_eq!(
        client.path_request(MessageType::Mkdir, "/dir").await.status(),
        Some(StatusCode::Ok)
    );
    for i in 0..10 {
        client.put_file(&format!("/dir/file{i}.txt"), b"x").await;
    }

    let handle = match client.opendir("/dir").await {
        Reply::Handle(handle) => handle,
        other => panic!("opendir failed: {other:?}"),
    };

    let mut seen = HashSet::new();
    loop {
        match client.readdir(&handle).await {
            Reply::Name(entries) => {
                assert!(!entries.is_empty() && entries.len() <= 3);
                for (filename, longname, attrs) in entries {
                    assert!(longname.ends_with(&filename));
                    assert_eq!(attrs.size, Some(1));
                    assert!(seen.insert(filename), "entry listed twice");
                }
            }
            Reply::Status(StatusCode::Eof, _) => break,
            other => panic!("readdir failed: {other:?}"),
        }
    }
    assert_eq!(seen.len(), 10);
    assert!(!seen.contains(".") && !seen.contains(".."));

    // Stays at EOF
    assert_eq!(client.readdir(&handle).await.status(), Some(StatusCode::Eof));
    assert_eq!(client.close(&handle).await.status(), Some(StatusCode::Ok));

    client.finish().await.unwrap();
}

/// Pipelined writes on one handle apply in arrival order
#[tokio::test]
async fn test_pipelined_writes_apply_in_order() {
    let fs = Arc::new(MemoryFs::new().sequential_writes(true));
    let mut client = TestClient::connect(fs.clone(), SessionLimits::default()).await;
    let handle = client.open_handle("/big.bin", CREATE).await;

    let mut expected = Vec::new();
    let mut ids = HashSet::new();
    for i in 0..50u8 {
        let chunk = vec![i; 100];
        let offset = expected.len() as u64;
        expected.extend_from_slice(&chunk);
        let id = client
            .send(MessageType::Write, |buf| {
                write_body(buf, &handle, offset, &chunk);
            })
            .await;
        ids.insert(id);
    }

    for _ in 0..50 {
        let (id, reply) = client.recv().await;
        assert!(ids.remove(&id), "unexpected reply id {id}");
        assert_eq!(reply.status(), Some(StatusCode::Ok));
    }
    assert_eq!(client.close(&handle).await.status(), Some(StatusCode::Ok));
    assert_eq!(client.get_file("/big.bin").await, expected);

    client.finish().await.unwrap();
}

/// A backend that cannot seek reports the write as unsupported
#[tokio::test]
async fn test_out_of_order_write_on_sequential_backend() {
    let fs = Arc::new(MemoryFs::new().sequential_writes(true));
    let mut client = TestClient::connect(fs, SessionLimits::default()).await;
    let handle = client.open_handle("/seq.bin", CREATE).await;

    assert_eq!(
        client.write(&handle, 10, b"late").await.status(),
        Some(StatusCode::OpUnsupported)
    );
    assert_eq!(
        client.write(&handle, 0, b"first").await.status(),
        Some(StatusCode::Ok)
    );

    client.finish().await.unwrap();
}

/// Paths climbing above the root never reach the backend
#[tokio::test]
async fn test_traversal_is_denied() {
    let (mut client, _fs) = TestClient::connect_memory().await;

    for path in ["/../etc/passwd", "../secret", "/a/../../b"] {
        let reply = client.open(path, OpenFlags::READ).await;
        assert_eq!(reply.status(), Some(StatusCode::PermissionDenied), "{path}");
    }
    assert_eq!(
        client
            .path_request(MessageType::Stat, "/..")
            .await
            .status(),
        Some(StatusCode::PermissionDenied)
    );

    client.finish().await.unwrap();
}

/// Opens beyond the per-session limit fail without leaking backend files
#[tokio::test]
async fn test_open_handle_limit() {
    let fs = TrackingFs::new(MemoryFs::new());
    let mut client = TestClient::connect(Arc::new(fs.clone()), limits(2, 100)).await;

    client.open_handle("/one", CREATE).await;
    let second = client.open_handle("/two", CREATE).await;
    assert_eq!(
        client.open("/three", CREATE).await.status(),
        Some(StatusCode::Failure)
    );
    assert_eq!(fs.open_files(), 2);

    // Closing frees a slot
    assert_eq!(client.close(&second).await.status(), Some(StatusCode::Ok));
    client.open_handle("/three", CREATE).await;
    assert_eq!(fs.open_files(), 2);

    client.finish().await.unwrap();
}

/// Handles the client never closed are released when the session ends
#[tokio::test]
async fn test_session_end_closes_open_handles() {
    let fs = TrackingFs::new(MemoryFs::new());
    let mut client = TestClient::connect(Arc::new(fs.clone()), SessionLimits::default()).await;

    let handle = client.open_handle("/left-open.txt", CREATE).await;
    assert_eq!(
        client.write(&handle, 0, b"pending").await.status(),
        Some(StatusCode::Ok)
    );
    client.open_handle("/left-open.txt", OpenFlags::READ).await;
    assert_eq!(fs.open_files(), 2);

    client.finish().await.unwrap();
    assert_eq!(fs.open_files(), 0);
}

/// Cancelling the session drains it and closes its handles
#[tokio::test]
async fn test_shutdown_drains_session() {
    let fs = TrackingFs::new(MemoryFs::new());
    let mut client = TestClient::connect(Arc::new(fs.clone()), SessionLimits::default()).await;
    client.open_handle("/a.txt", CREATE).await;

    client.shutdown.cancel();
    client.join().await.unwrap();
    assert_eq!(fs.open_files(), 0);
}

/// Path operations map backend errors onto SFTP status codes
#[tokio::test]
async fn test_path_operations() {
    let (mut client, fs) = TestClient::connect_memory().await;

    assert_eq!(
        client.path_request(MessageType::Stat, "/missing").await.status(),
        Some(StatusCode::NoSuchFile)
    );
    assert_eq!(
        client.path_request(MessageType::Mkdir, "/docs").await.status(),
        Some(StatusCode::Ok)
    );
    match client.path_request(MessageType::Stat, "/docs").await {
        Reply::Attrs(attrs) => assert!(attrs.is_dir()),
        other => panic!("stat failed: {other:?}"),
    }

    client.put_file("/docs/a.txt", b"abc").await;
    match client.path_request(MessageType::Lstat, "/docs/a.txt").await {
        Reply::Attrs(attrs) => assert_eq!(attrs.size, Some(3)),
        other => panic!("lstat failed: {other:?}"),
    }

    assert_eq!(
        client.path_request(MessageType::Rmdir, "/docs").await.status(),
        Some(StatusCode::Failure)
    );
    assert_eq!(
        client.rename("/docs/a.txt", "/docs/b.txt").await.status(),
        Some(StatusCode::Ok)
    );
    assert_eq!(client.get_file("/docs/b.txt").await, b"abc");
    assert_eq!(
        client.path_request(MessageType::Remove, "/docs/b.txt").await.status(),
        Some(StatusCode::Ok)
    );
    assert_eq!(
        client.path_request(MessageType::Rmdir, "/docs").await.status(),
        Some(StatusCode::Ok)
    );
    assert!(
        fs.stat(&VfsPath::parse("/docs").unwrap())
            .await
            .unwrap_err()
            .is_not_found()
    );

    client.finish().await.unwrap();
}

/// Realpath normalises against the VFS root
#[tokio::test]
async fn test_realpath_normalises() {
    let (mut client, _fs) = TestClient::connect_memory().await;

    for (input, expected) in [(".", "/"), ("a/../b", "/b"), ("/x//y/./z", "/x/y/z")] {
        match client.path_request(MessageType::Realpath, input).await {
            Reply::Name(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].0, expected, "realpath {input}");
            }
            other => panic!("realpath {input} failed: {other:?}"),
        }
    }

    client.finish().await.unwrap();
}

/// Handle-based stat and truncate
#[tokio::test]
async fn test_fstat_and_fsetstat() {
    let (mut client, _fs) = TestClient::connect_memory().await;
    let handle = client.open_handle("/f.txt", CREATE).await;
    assert_eq!(
        client.write(&handle, 0, b"0123456789").await.status(),
        Some(StatusCode::Ok)
    );

    match client
        .call(MessageType::Fstat, |buf| codec::put_bytes(buf, &handle))
        .await
    {
        Reply::Attrs(attrs) => assert_eq!(attrs.size, Some(10)),
        other => panic!("fstat failed: {other:?}"),
    }

    let reply = client
        .call(MessageType::Fsetstat, |buf| {
            codec::put_bytes(buf, &handle);
            // SSH_FILEXFER_ATTR_SIZE
            buf.put_u32(0x0000_0001);
            buf.put_u64(4);
        })
        .await;
    assert_eq!(reply.status(), Some(StatusCode::Ok));
    assert_eq!(client.close(&handle).await.status(), Some(StatusCode::Ok));
    assert_eq!(client.get_file("/f.txt").await, b"0123");

    client.finish().await.unwrap();
}

/// Growing a file past what the store can hold fails the request, not the server
#[tokio::test]
async fn test_huge_file_growth_is_refused() {
    let (mut client, fs) = TestClient::connect_memory().await;
    let handle = client.open_handle("/big", OpenFlags::WRITE | OpenFlags::CREAT).await;

    assert_eq!(
        client.write(&handle, 1 << 62, b"x").await.status(),
        Some(StatusCode::Failure)
    );
    let reply = client
        .call(MessageType::Fsetstat, |buf| {
            codec::put_bytes(buf, &handle);
            buf.put_u32(0x0000_0001);
            buf.put_u64(u64::MAX);
        })
        .await;
    assert_eq!(reply.status(), Some(StatusCode::Failure));
    let reply = client
        .call(MessageType::Setstat, |buf| {
            codec::put_string(buf, "/big");
            buf.put_u32(0x0000_0001);
            buf.put_u64(1 << 40);
        })
        .await;
    assert_eq!(reply.status(), Some(StatusCode::Failure));
    assert_eq!(fs.used(), 0);

    assert_eq!(client.write(&handle, 0, b"ok").await.status(), Some(StatusCode::Ok));
    assert_eq!(client.close(&handle).await.status(), Some(StatusCode::Ok));
    assert_eq!(client.get_file("/big").await, b"ok");

    client.finish().await.unwrap();
}

/// Requests the server does not implement
#[tokio::test]
async fn test_unsupported_requests() {
    let (mut client, _fs) = TestClient::connect_memory().await;

    let reply = client
        .call(MessageType::Symlink, |buf| {
            codec::put_string(buf, "/target");
            codec::put_string(buf, "/link");
        })
        .await;
    assert_eq!(reply.status(), Some(StatusCode::OpUnsupported));

    let reply = client
        .call(MessageType::Extended, |buf| {
            codec::put_string(buf, "statvfs@openssh.com");
        })
        .await;
    assert_eq!(reply.status(), Some(StatusCode::OpUnsupported));

    client.finish().await.unwrap();
}

/// A request with a truncated body is answered, the session carries on
#[tokio::test]
async fn test_malformed_request_is_bad_message() {
    let (mut client, _fs) = TestClient::connect_memory().await;

    let reply = client
        .call(MessageType::Open, |buf| {
            // length prefix promises more than is sent
            buf.put_u32(100);
            buf.put_slice(b"/short");
        })
        .await;
    assert_eq!(reply.status(), Some(StatusCode::BadMessage));

    client.put_file("/after.txt", b"ok").await;
    client.finish().await.unwrap();
}

/// The server never offers more than version 3
#[tokio::test]
async fn test_version_negotiation() {
    let mut client = TestClient::spawn(Arc::new(MemoryFs::new()), SessionLimits::default());
    assert_eq!(client.init(6).await, 3);
    client.finish().await.unwrap();
}

/// Speaking before SSH_FXP_INIT ends the session
#[tokio::test]
async fn test_request_before_init_is_rejected() {
    let mut client = TestClient::spawn(Arc::new(MemoryFs::new()), SessionLimits::default());

    client
        .send(MessageType::Stat, |buf| codec::put_string(buf, "/"))
        .await;
    assert!(client.join().await.is_err());
}

/// A frame above the packet limit terminates the session
#[tokio::test]
async fn test_oversized_packet_terminates_session() {
    let limits = SessionLimits {
        max_packet_size: 1024,
        ..SessionLimits::default()
    };
    let mut client = TestClient::connect(Arc::new(MemoryFs::new()), limits).await;
    let handle = client.open_handle("/x", CREATE).await;

    let mut packet = BytesMut::new();
    packet.put_u8(MessageType::Write as u8);
    packet.put_u32(99);
    write_body(&mut packet, &handle, 0, &[0u8; 4096]);
    client.send_raw(Bytes::from(packet)).await;

    assert!(client.join().await.is_err());
}
