use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::remote::{RemoteClient, RemoteConfig};

pub(crate) type Seen = Arc<std::sync::Mutex<Vec<String>>>;

pub(crate) async fn fake_remote(replies: Vec<&'static str>) -> (u16, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen: Seen = Arc::default();
    let recorded = seen.clone();
    tokio::spawn(async move {
        for reply in replies {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            recorded.lock().unwrap().push(String::from_utf8(buf).unwrap());
            sock.write_all(reply.as_bytes()).await.unwrap();
        }
    });
    (port, seen)
}

pub(crate) fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub(crate) fn remote_client(port: u16) -> RemoteClient {
    RemoteClient::new(RemoteConfig {
        port,
        timeout: Duration::from_secs(2),
        retries: 0,
        backoff: Duration::from_millis(10),
        procs_script: PathBuf::from("/opt/procs/mcp_procs.tcl"),
        ..RemoteConfig::default()
    })
}

pub(crate) fn args(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}
