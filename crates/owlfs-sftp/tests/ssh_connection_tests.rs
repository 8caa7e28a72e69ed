//! SSH connection tests
//!
//! Drive a running [`owlfs_sftp::Server`] with a russh client: the retry cap,
//! exec requests, and several SFTP channels sharing one connection.

mod common;

use common::{Reply, TestClient, write_body};
use owlfs_core::{MemoryFs, OpenOptions, Vfs, VfsPath};
use owlfs_sftp::protocol::{MessageType, OpenFlags, StatusCode};
use owlfs_sftp::{Config, Server};
use russh::keys::PublicKey;
use russh::{ChannelMsg, client};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(20);

struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Harness {
    server: Server,
    addr: SocketAddr,
    fs: Arc<MemoryFs>,
    _cache: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let cache = TempDir::new().unwrap();
        let config = Config {
            listen_addr: "127.0.0.1:0".to_string(),
            cache_dir: Some(cache.path().to_path_buf()),
            authorized_keys: None,
            user: Some("alice".to_string()),
            pass: Some("secret".to_string()),
            max_auth_attempts: 3,
            ..Default::default()
        };
        let fs = Arc::new(MemoryFs::new());
        let server = Server::new(config, fs.clone()).unwrap();
        let addr = server.serve().await.unwrap();
        Self {
            server,
            addr,
            fs,
            _cache: cache,
        }
    }

    async fn connect(&self) -> client::Handle<AcceptAnyHostKey> {
        let config = Arc::new(client::Config::default());
        client::connect(config, self.addr, AcceptAnyHostKey)
            .await
            .unwrap()
    }

    async fn login(&self) -> client::Handle<AcceptAnyHostKey> {
        let mut session = self.connect().await;
        let auth = session
            .authenticate_password("alice", "secret")
            .await
            .unwrap();
        assert!(auth.success());
        session
    }

    async fn put(&self, path: &str, content: &[u8]) {
        let path = VfsPath::parse(path).unwrap();
        let file = self
            .fs
            .open(&path, OpenOptions::create_truncate())
            .await
            .unwrap();
        file.write_at(0, content).await.unwrap();
        file.close().await.unwrap();
    }

    async fn stop(self) {
        self.server.shutdown();
        tokio::time::timeout(DEADLINE, self.server.wait())
            .await
            .expect("server did not stop");
    }
}

/// Everything an exec channel produced before it closed
#[derive(Debug, Default)]
struct ExecOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
}

async fn exec(session: &client::Handle<AcceptAnyHostKey>, command: &str) -> ExecOutput {
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, command).await.unwrap();

    let mut output = ExecOutput::default();
    let collect = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    output.stderr.extend_from_slice(&data);
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(DEADLINE, collect)
        .await
        .expect("exec channel did not close");
    output
}

async fn open_sftp(
    session: &client::Handle<AcceptAnyHostKey>,
) -> TestClient<russh::ChannelStream<client::Msg>> {
    let mut channel = session.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => break,
            Some(ChannelMsg::Failure) | None => panic!("sftp subsystem refused"),
            Some(_) => {}
        }
    }
    TestClient::over(channel.into_stream()).await
}

/// Wrong passwords up to the cap get the connection dropped
#[tokio::test]
async fn test_retry_cap_closes_connection() {
    let harness = Harness::start().await;
    let mut session = harness.connect().await;

    for _ in 0..3 {
        let attempt = tokio::time::timeout(
            DEADLINE,
            session.authenticate_password("alice", "wrong"),
        )
        .await
        .expect("authentication attempt hung");
        if let Ok(result) = attempt {
            assert!(!result.success());
        }
    }

    tokio::time::timeout(DEADLINE, async {
        while !session.is_closed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection stayed open after the retry cap");

    harness.stop().await;
}

/// Exec requests run one emulator command with stdout, stderr and exit status
#[tokio::test]
async fn test_exec_checksum() {
    let harness = Harness::start().await;
    harness.put("/a", b"hello").await;
    let session = harness.login().await;

    let output = exec(&session, "md5sum /a").await;
    assert_eq!(output.stdout, b"5d41402abc4b2a76b9719d911017c592  /a\n");
    assert!(output.stderr.is_empty());
    assert_eq!(output.exit_status, Some(0));

    let output = exec(&session, "md5sum /missing").await;
    assert!(output.stdout.is_empty());
    assert!(!output.stderr.is_empty());
    assert_eq!(output.exit_status, Some(1));

    harness.stop().await;
}

/// Two SFTP channels on one connection keep separate handle tables
#[tokio::test]
async fn test_sftp_channels_share_a_connection() {
    let harness = Harness::start().await;
    let session = harness.login().await;

    let mut first = open_sftp(&session).await;
    let mut second = open_sftp(&session).await;

    first.put_file("/shared.txt", b"from the first channel").await;
    assert_eq!(second.get_file("/shared.txt").await, b"from the first channel");

    let handle = first.open_handle("/shared.txt", OpenFlags::READ).await;
    assert_eq!(
        second.read(&handle, 0, 16).await.status(),
        Some(StatusCode::InvalidHandle)
    );
    assert_eq!(
        second.close(&handle).await.status(),
        Some(StatusCode::InvalidHandle)
    );
    assert_eq!(first.read(&handle, 0, 4).await, Reply::Data(b"from".to_vec()));
    assert_eq!(first.close(&handle).await.status(), Some(StatusCode::Ok));

    harness.stop().await;
}

/// An upload larger than every buffer on the way arrives intact
#[tokio::test]
async fn test_pipelined_upload_over_ssh() {
    const CHUNK: usize = 16 * 1024;
    const CHUNKS: usize = 256;
    const IN_FLIGHT: usize = 32;

    let harness = Harness::start().await;
    let session = harness.login().await;
    let mut client = open_sftp(&session).await;

    let content: Vec<u8> = (0..CHUNK * CHUNKS).map(|i| (i % 251) as u8).collect();
    let handle = client
        .open_handle("/big.bin", OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC)
        .await;

    let upload = async {
        let mut pending = HashSet::new();
        for (index, chunk) in content.chunks(CHUNK).enumerate() {
            if pending.len() == IN_FLIGHT {
                let (id, reply) = client.recv().await;
                assert_eq!(reply.status(), Some(StatusCode::Ok));
                assert!(pending.remove(&id));
            }
            let offset = (index * CHUNK) as u64;
            let id = client
                .send(MessageType::Write, |buf| write_body(buf, &handle, offset, chunk))
                .await;
            pending.insert(id);
        }
        while !pending.is_empty() {
            let (id, reply) = client.recv().await;
            assert_eq!(reply.status(), Some(StatusCode::Ok));
            assert!(pending.remove(&id));
        }
        assert_eq!(client.close(&handle).await.status(), Some(StatusCode::Ok));
    };
    tokio::time::timeout(DEADLINE, upload)
        .await
        .expect("upload stalled");

    let meta = harness
        .fs
        .stat(&VfsPath::parse("/big.bin").unwrap())
        .await
        .unwrap();
    assert_eq!(meta.size, content.len() as u64);
    assert_eq!(client.get_file("/big.bin").await, content);

    harness.stop().await;
}
