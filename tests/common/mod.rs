//! Simulated modem module for integration tests.
//!
//! Speaks AT with echo, switches to OBEX on `AT^SQWE=3`, serves an
//! in-memory flash filesystem and returns to AT on `+++`.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use modemlink::{Modem, ModemBuilder};
use modemlink::obex::{
    set_path_flags, HeaderId, ObexFrame, ObexHeader, Opcode, Preamble, ResponseCode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

pub const IDENTITY: &str = "Cinterion\r\nTC65\r\nREVISION 02.000";
pub const CONNECTION_ID: u32 = 0x0000_0007;

/// Canned reply for one AT command.
#[derive(Debug, Clone)]
pub struct Script {
    /// Bytes sent instead of the echo + `OK` default.
    pub raw: Vec<u8>,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub enum Node {
    Dir(BTreeMap<String, Node>),
    File(Vec<u8>),
}

impl Node {
    fn dir() -> Self {
        Node::Dir(BTreeMap::new())
    }
}

struct Download {
    data: Vec<u8>,
    offset: usize,
}

struct Upload {
    name: String,
    data: Vec<u8>,
}

pub struct ModuleState {
    pub commands: Vec<String>,
    pub requests: Vec<Opcode>,
    pub scripts: HashMap<String, Script>,
    pub root: Node,
    pub cwd: Vec<String>,
    pub obex_mode: bool,
    pub get_chunk: usize,
    pub put_ack_delay: Duration,
    /// Delay before answering a GET continuation.
    pub get_ack_delay: Duration,
    /// Answer CONNECT with this code instead of success.
    pub reject_connect: Option<ResponseCode>,
    pub disk_space: u32,
    pub free_space: u32,
    /// Body bytes of the upload that was running when ABORT arrived.
    pub aborted_upload: Option<usize>,
    download: Option<Download>,
    upload: Option<Upload>,
}

impl ModuleState {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
            requests: Vec::new(),
            scripts: HashMap::new(),
            root: Node::dir(),
            cwd: Vec::new(),
            obex_mode: false,
            get_chunk: 1024,
            put_ack_delay: Duration::ZERO,
            get_ack_delay: Duration::ZERO,
            reject_connect: None,
            disk_space: 1_048_576,
            free_space: 524_288,
            aborted_upload: None,
            download: None,
            upload: None,
        }
    }

    fn dir_at(&mut self, path: &[String]) -> Option<&mut BTreeMap<String, Node>> {
        let mut node = &mut self.root;
        for part in path {
            node = match node {
                Node::Dir(entries) => entries.get_mut(part)?,
                Node::File(_) => return None,
            };
        }
        match node {
            Node::Dir(entries) => Some(entries),
            Node::File(_) => None,
        }
    }

    fn cwd_entries(&mut self) -> &mut BTreeMap<String, Node> {
        let cwd = self.cwd.clone();
        if self.dir_at(&cwd).is_none() {
            self.cwd.clear();
        }
        let cwd = self.cwd.clone();
        match self.dir_at(&cwd) {
            Some(entries) => entries,
            None => unreachable!("root is always a directory"),
        }
    }

    fn listing_xml(&mut self) -> Vec<u8> {
        let mut xml = String::from(
            "<?xml version=\"1.0\"?>\r\n<!DOCTYPE folder-listing SYSTEM \"obex-folder-listing.dtd\">\r\n<folder-listing version=\"1.0\">\r\n",
        );
        if !self.cwd.is_empty() {
            xml.push_str("<parent-folder/>\r\n");
        }
        for (name, node) in self.cwd_entries().iter() {
            match node {
                Node::Dir(_) => xml.push_str(&format!(
                    "<folder name=\"{}\" modified=\"20140301T101500\"/>\r\n",
                    name
                )),
                Node::File(data) => xml.push_str(&format!(
                    "<file name=\"{}\" size=\"{}\" modified=\"20140301T101510\"/>\r\n",
                    name,
                    data.len()
                )),
            }
        }
        xml.push_str("</folder-listing>\r\n");
        xml.into_bytes()
    }

    /// Find a name in the current folder the way the module does: ignoring case.
    fn lookup(&mut self, name: &str) -> Option<String> {
        self.cwd_entries()
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
    }
}

/// Handle on the simulated module.
#[derive(Clone)]
pub struct FakeModule {
    state: Arc<Mutex<ModuleState>>,
    out: mpsc::UnboundedSender<Vec<u8>>,
}

impl FakeModule {
    /// Spawn a module on one end of a duplex link and return the other end.
    pub fn spawn() -> (FakeModule, DuplexStream) {
        let (host, module) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(module);
        let (out, out_rx) = mpsc::unbounded_channel();
        let fake = FakeModule {
            state: Arc::new(Mutex::new(ModuleState::new())),
            out,
        };
        tokio::spawn(write_loop(write_half, out_rx));
        tokio::spawn(fake.clone().read_loop(read_half));
        (fake, host)
    }

    pub fn state(&self) -> MutexGuard<'_, ModuleState> {
        self.state.lock().unwrap()
    }

    /// Reply to `command` with `raw` after `delay`.
    pub fn script(&self, command: &str, raw: &[u8], delay: Duration) {
        self.state().scripts.insert(
            command.to_string(),
            Script {
                raw: raw.to_vec(),
                delay,
            },
        );
    }

    /// Push unsolicited bytes to the host.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.out.send(bytes.to_vec());
    }

    pub fn add_file(&self, path: &[&str], name: &str, data: &[u8]) {
        let path: Vec<String> = path.iter().map(|p| p.to_string()).collect();
        let mut state = self.state();
        let dir = state.dir_at(&path).expect("folder exists");
        dir.insert(name.to_string(), Node::File(data.to_vec()));
    }

    pub fn add_dir(&self, path: &[&str], name: &str) {
        let path: Vec<String> = path.iter().map(|p| p.to_string()).collect();
        let mut state = self.state();
        let dir = state.dir_at(&path).expect("folder exists");
        dir.entry(name.to_string()).or_insert_with(Node::dir);
    }

    pub fn file(&self, path: &[&str], name: &str) -> Option<Vec<u8>> {
        let path: Vec<String> = path.iter().map(|p| p.to_string()).collect();
        let mut state = self.state();
        match state.dir_at(&path)?.get(name)? {
            Node::File(data) => Some(data.clone()),
            Node::Dir(_) => None,
        }
    }

    pub fn exists(&self, path: &[&str], name: &str) -> bool {
        let path: Vec<String> = path.iter().map(|p| p.to_string()).collect();
        let mut state = self.state();
        state
            .dir_at(&path)
            .map_or(false, |dir| dir.contains_key(name))
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn requests(&self) -> Vec<Opcode> {
        self.state().requests.clone()
    }

    fn send(&self, bytes: Vec<u8>, delay: Duration) {
        if delay.is_zero() {
            let _ = self.out.send(bytes);
        } else {
            let out = self.out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = out.send(bytes);
            });
        }
    }

    async fn read_loop(self, mut reader: ReadHalf<DuplexStream>) {
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);

            loop {
                let obex = self.state().obex_mode;
                let consumed = if obex {
                    self.take_obex(&mut pending).await
                } else {
                    self.take_command(&mut pending)
                };
                if !consumed {
                    break;
                }
            }
        }
    }

    fn take_command(&self, pending: &mut Vec<u8>) -> bool {
        let Some(end) = pending.iter().position(|b| *b == b'\r') else {
            return false;
        };
        let line: Vec<u8> = pending.drain(..=end).collect();
        let command = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();

        let script = {
            let mut state = self.state();
            state.commands.push(command.clone());
            state.scripts.get(&command).cloned()
        };
        if let Some(script) = script {
            self.send(script.raw, script.delay);
            return true;
        }

        let echo = format!("{}\r", command);
        let reply = match command.to_ascii_uppercase().as_str() {
            "ATI" => format!("{}\r\n{}\r\n\r\nOK\r\n", echo, IDENTITY),
            _ => format!("{}\r\nOK\r\n", echo),
        };
        self.send(reply.into_bytes(), Duration::ZERO);

        if command.eq_ignore_ascii_case("AT^SQWE=3") {
            self.state().obex_mode = true;
        }
        true
    }

    async fn take_obex(&self, pending: &mut Vec<u8>) -> bool {
        if pending.starts_with(b"+++") {
            pending.drain(..3);
            self.state().obex_mode = false;
            self.send(b"\r\nOK\r\n".to_vec(), Duration::ZERO);
            return true;
        }
        if pending.len() < 3 {
            return false;
        }
        let length = usize::from(u16::from_be_bytes([pending[1], pending[2]]));
        if length < 3 {
            pending.clear();
            return false;
        }
        if pending.len() < length {
            return false;
        }
        let raw: Vec<u8> = pending.drain(..length).collect();
        let request = ObexFrame::decode_request(&raw).expect("host sent a valid request");

        let (response, delay) = self.serve(&request);
        let bytes = response.encode().expect("response encodes");
        if delay.is_zero() {
            self.send(bytes.to_vec(), Duration::ZERO);
        } else {
            // Keep request order: acknowledge only after the delay.
            tokio::time::sleep(delay).await;
            self.send(bytes.to_vec(), Duration::ZERO);
        }
        true
    }

    fn serve(&self, request: &ObexFrame) -> (ObexFrame, Duration) {
        let mut state = self.state();
        let op = request.opcode().expect("request frame");
        state.requests.push(op);

        if op != Opcode::Connect && op != Opcode::Abort {
            if request.connection_id() != Some(CONNECTION_ID) {
                return (ObexFrame::response(ResponseCode::BadRequest), Duration::ZERO);
            }
        }

        match op {
            Opcode::Connect if state.reject_connect.is_some() => {
                let code = state.reject_connect.unwrap_or(ResponseCode::Forbidden);
                (ObexFrame::response(code), Duration::ZERO)
            }
            Opcode::Connect => (
                ObexFrame::response(ResponseCode::Success)
                    .with_preamble(Preamble::Connect {
                        version: 0x10,
                        flags: 0,
                        max_packet_length: 0x4000,
                    })
                    .with_header(ObexHeader::ConnectionId(CONNECTION_ID)),
                Duration::ZERO,
            ),
            Opcode::Disconnect => (ObexFrame::response(ResponseCode::Success), Duration::ZERO),
            Opcode::Abort => {
                if let Some(upload) = state.upload.take() {
                    state.aborted_upload = Some(upload.data.len());
                    state
                        .cwd_entries()
                        .insert(upload.name, Node::File(upload.data));
                }
                state.download = None;
                (ObexFrame::response(ResponseCode::Success), Duration::ZERO)
            }
            Opcode::SetPath => (ObexFrame::response(set_path(&mut state, request)), Duration::ZERO),
            Opcode::GetFinal => {
                let data = if request.get(HeaderId::Type).is_some() {
                    Some(state.listing_xml())
                } else {
                    let name = request.name().unwrap_or_default().to_string();
                    match state.lookup(&name).and_then(|key| state.cwd_entries().get(&key).cloned()) {
                        Some(Node::File(data)) => Some(data),
                        _ => None,
                    }
                };
                match data {
                    Some(data) => {
                        state.download = Some(Download { data, offset: 0 });
                        (next_chunk(&mut state, true), Duration::ZERO)
                    }
                    None => (ObexFrame::response(ResponseCode::NotFound), Duration::ZERO),
                }
            }
            Opcode::Get => {
                let delay = state.get_ack_delay;
                (next_chunk(&mut state, false), delay)
            }
            Opcode::Put => {
                let delay = state.put_ack_delay;
                if let Some(name) = request.name() {
                    state.upload = Some(Upload {
                        name: name.to_string(),
                        data: Vec::new(),
                    });
                    return (ObexFrame::response(ResponseCode::Continue), Duration::ZERO);
                }
                match (state.upload.as_mut(), request.body()) {
                    (Some(upload), Some(body)) => {
                        upload.data.extend_from_slice(body);
                        (ObexFrame::response(ResponseCode::Continue), delay)
                    }
                    _ => (ObexFrame::response(ResponseCode::BadRequest), Duration::ZERO),
                }
            }
            Opcode::PutFinal => (put_final(&mut state, request), Duration::ZERO),
            Opcode::Session => (ObexFrame::response(ResponseCode::NotImplemented), Duration::ZERO),
        }
    }
}

fn set_path(state: &mut ModuleState, request: &ObexFrame) -> ResponseCode {
    let flags = match request.preamble() {
        Preamble::SetPath { flags, .. } => flags,
        _ => return ResponseCode::BadRequest,
    };
    if flags == set_path_flags::PARENT {
        return if state.cwd.pop().is_some() {
            ResponseCode::Success
        } else {
            ResponseCode::NotFound
        };
    }

    let name = request.name().unwrap_or_default().to_string();
    if name.contains(':') {
        state.cwd.clear();
        return ResponseCode::Success;
    }
    if flags == set_path_flags::CREATE {
        state
            .cwd_entries()
            .entry(name.clone())
            .or_insert_with(Node::dir);
        state.cwd.push(name);
        return ResponseCode::Success;
    }

    match state.lookup(&name) {
        Some(key) if matches!(state.cwd_entries().get(&key), Some(Node::Dir(_))) => {
            state.cwd.push(key);
            ResponseCode::Success
        }
        _ => ResponseCode::NotFound,
    }
}

fn next_chunk(state: &mut ModuleState, first: bool) -> ObexFrame {
    let chunk_size = state.get_chunk;
    let Some(download) = state.download.as_mut() else {
        return ObexFrame::response(ResponseCode::BadRequest);
    };
    let end = (download.offset + chunk_size).min(download.data.len());
    let chunk = Bytes::copy_from_slice(&download.data[download.offset..end]);
    let total = download.data.len() as u32;
    download.offset = end;

    let done = end == download.data.len();
    let mut response = if done {
        ObexFrame::response(ResponseCode::Success).with_header(ObexHeader::EndOfBody(chunk))
    } else {
        ObexFrame::response(ResponseCode::Continue).with_header(ObexHeader::Body(chunk))
    };
    if first {
        response.insert_first(ObexHeader::Length(total));
    }
    if done {
        state.download = None;
    }
    response
}

fn put_final(state: &mut ModuleState, request: &ObexFrame) -> ObexFrame {
    if let Some(params) = request.app_parameters().cloned() {
        return app_request(state, &params);
    }

    if let Some(upload) = state.upload.take() {
        let mut data = upload.data;
        if let Some(body) = request.body() {
            data.extend_from_slice(body);
        }
        state.free_space = state.free_space.saturating_sub(data.len() as u32);
        state.cwd_entries().insert(upload.name, Node::File(data));
        return ObexFrame::response(ResponseCode::Success);
    }

    // NAME alone deletes.
    let name = request.name().unwrap_or_default().to_string();
    let Some(key) = state.lookup(&name) else {
        return ObexFrame::response(ResponseCode::NotFound);
    };
    if let Some(Node::Dir(children)) = state.cwd_entries().get(&key) {
        if !children.is_empty() {
            return ObexFrame::response(ResponseCode::PreconditionFailed);
        }
    }
    state.cwd_entries().remove(&key);
    ObexFrame::response(ResponseCode::Success)
}

fn app_request(state: &mut ModuleState, params: &[u8]) -> ObexFrame {
    match params.first() {
        Some(0x31) => {
            state.root = Node::dir();
            state.cwd.clear();
            ObexFrame::response(ResponseCode::Success)
        }
        Some(0x32) => {
            let value = match params.get(2) {
                Some(0x01) => state.disk_space,
                Some(0x02) => state.free_space,
                _ => return ObexFrame::response(ResponseCode::BadRequest),
            };
            let mut payload = vec![0x32, 0x04];
            payload.extend_from_slice(&value.to_be_bytes());
            ObexFrame::response(ResponseCode::Success)
                .with_header(ObexHeader::AppParameters(Bytes::from(payload)))
        }
        Some(0x34) => match parse_move(params) {
            Some((old, new)) => {
                let Some(key) = state.lookup(&old) else {
                    return ObexFrame::response(ResponseCode::NotFound);
                };
                let entries = state.cwd_entries();
                if let Some(node) = entries.remove(&key) {
                    entries.insert(new, node);
                }
                ObexFrame::response(ResponseCode::Success)
            }
            None => ObexFrame::response(ResponseCode::BadRequest),
        },
        _ => ObexFrame::response(ResponseCode::NotImplemented),
    }
}

fn parse_move(params: &[u8]) -> Option<(String, String)> {
    let rest = params.get(6..)?;
    let (old, rest) = tagged_utf16(rest, 0x35)?;
    let (new, _) = tagged_utf16(rest, 0x36)?;
    Some((old, new))
}

fn tagged_utf16(bytes: &[u8], tag: u8) -> Option<(String, &[u8])> {
    if *bytes.first()? != tag {
        return None;
    }
    let len = usize::from(*bytes.get(1)?);
    let raw = bytes.get(2..2 + len)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Some((String::from_utf16(&units).ok()?, &bytes[2 + len..]))
}

async fn write_loop(mut writer: WriteHalf<DuplexStream>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

/// Builder with timing short enough for tests.
pub fn fast_builder() -> ModemBuilder {
    ModemBuilder::new()
        .command_spacing(Duration::from_millis(1))
        .at_wait(Duration::from_millis(500), 2)
        .escape_wait(Duration::from_millis(200), 2)
        .obex_wait(Duration::from_millis(500), 2)
        .delete_all_wait(Duration::from_millis(500))
}

/// Spawn a module and start a modem on it.
pub async fn start_modem(builder: ModemBuilder) -> (FakeModule, Modem) {
    init_tracing();
    let (module, host) = FakeModule::spawn();
    let modem = builder.start(host).await.expect("session negotiated");
    (module, modem)
}

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
