//! Shared fixtures for the daemon integration tests
//!
//! The fake transcoder is a shell script. For a split it reads
//! `<length secs> <delay per segment> <exit code>` from the input file and
//! behaves like ffmpeg's segment muxer for an input of that length.

#![allow(dead_code)]

use cluster_encode_daemon::{Config, Daemon, DaemonClient, DaemonError};
use serde_json::{json, Value};
use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub const SECRET: &str = "integration-secret";

const FAKE_FFMPEG: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then
  echo "ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023 the FFmpeg developers"
  echo "built with gcc 13 (Ubuntu 13.2.0-23ubuntu3)"
  exit 0
fi
if [ "$2" = "-encoders" ]; then
  cat <<'LIST'
Encoders:
 V..... = Video
 A..... = Audio
 S..... = Subtitle
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (codec h264)
 V....D libx265              libx265 H.265 / HEVC (codec hevc)
 A....D aac                  AAC (Advanced Audio Coding)
 S..... ass                  ASS (Advanced SubStation Alpha) subtitle
LIST
  exit 0
fi

input=""
chunk=""
prev=""
pattern=""
for arg in "$@"; do
  case "$prev" in
    -i) input="$arg" ;;
    -segment_time) chunk="$arg" ;;
  esac
  prev="$arg"
  pattern="$arg"
done

read -r total delay code < "$input"
delay=${delay:-0}
n=$(( (total + chunk - 1) / chunk ))
i=0
while [ "$i" -lt "$n" ]; do
  f=$(printf "$pattern" "$i")
  : > "$f"
  echo "[segment @ 0x5581c0a4c740] Opening '$f' for writing" >&2
  echo "out_time_us=$(( (i + 1) * chunk ))000000" >&2
  echo "speed=120x" >&2
  echo "progress=continue" >&2
  if [ "$delay" != "0" ]; then
    sleep "$delay"
  fi
  i=$((i + 1))
done
exit "${code:-0}"
"#;

/// A daemon serving on an ephemeral port inside a scratch directory
pub struct TestDaemon {
    pub addr: SocketAddr,
    pub dir: TempDir,
    pub handle: JoinHandle<Result<(), DaemonError>>,
}

impl TestDaemon {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("shared");
        let local = dir.path().join("local");
        fs::create_dir_all(shared.join("out")).unwrap();
        fs::create_dir_all(&local).unwrap();
        let transcoder = write_fake_ffmpeg(dir.path());

        let mut config = Config::default();
        config.dirs.shared_working_dir = shared;
        config.dirs.local_working_dir = local;
        config.listen.host = "127.0.0.1".to_string();
        config.listen.port = 0;
        config.listen.shared_secret = SECRET.to_string();
        config.node.num_chunks = 4;
        config.node.is_file_host = true;
        config.transcoder.report_interval_ms = 20;

        let daemon = Daemon::new_without_checks(config, transcoder);
        let listener = daemon.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move { daemon.serve(listener).await });

        Self { addr, dir, handle }
    }

    pub fn shared(&self) -> PathBuf {
        self.dir.path().join("shared")
    }

    /// Write an input file describing how the fake transcoder should behave
    pub fn write_input(&self, name: &str, length_secs: u64, delay: &str, exit_code: i32) {
        fs::write(
            self.shared().join(name),
            format!("{} {} {}\n", length_secs, delay, exit_code),
        )
        .unwrap();
    }

    pub async fn client(&self) -> DaemonClient {
        DaemonClient::connect(self.addr, SECRET).await.unwrap()
    }
}

fn write_fake_ffmpeg(dir: &Path) -> PathBuf {
    let path = dir.join("ffmpeg");
    fs::write(&path, FAKE_FFMPEG).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn split_command(input: &str, chunk_size: u64, length: Option<u64>) -> Value {
    let mut envelope = json!({
        "protocolVersion": "1.0.0",
        "command": "split",
        "inputFile": format!("%shared%/{}", input),
        "outputDir": "%shared%/out",
        "chunkSize": chunk_size,
    });
    if let Some(length) = length {
        envelope["length"] = json!(length);
    }
    envelope
}

/// Receive with a generous timeout so a hung daemon fails the test
pub async fn recv(client: &mut DaemonClient) -> Option<Value> {
    tokio::time::timeout(Duration::from_secs(20), client.recv())
        .await
        .expect("timed out waiting for the daemon")
        .unwrap()
}

/// Collect messages up to and including the `split finished` reply
pub async fn collect_split(client: &mut DaemonClient) -> (Vec<Value>, Value) {
    let mut messages = Vec::new();
    loop {
        let message = recv(client).await.expect("connection closed during split");
        if message["status"] == "split finished" {
            return (messages, message);
        }
        messages.push(message);
    }
}

/// Skip messages until one with the given status arrives
pub async fn wait_for(client: &mut DaemonClient, status: &str) -> Value {
    loop {
        let message = recv(client).await.expect("connection closed");
        if message["status"] == status {
            return message;
        }
    }
}

pub fn with_status<'a>(messages: &'a [Value], status: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["status"] == status).collect()
}
