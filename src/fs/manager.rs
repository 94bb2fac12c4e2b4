//! Filesystem operations on the module's flash over OBEX.
//!
//! [`FileManager`] keeps the current directory and its listing cached.
//! Every operation opens OBEX mode on demand, and every mutating operation
//! re-reads the listing before it returns. Operations are serialized by one
//! operation lock; [`FileManager::cancel`] does not take it, so it can run
//! while a transfer is in flight.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Mutex as AsyncMutex;

use super::listing::{parse_listing, FOLDER_LISTING_TYPE};
use super::meta::{FileContent, FileMeta, ROOT_DRIVE};
use super::transfer::{Operation, ProgressEvent, TransferControl, TransferState};
use crate::error::{ModemError, Result};
use crate::events::{EventHub, ListenerId};
use crate::obex::{
    encode_utf16be, set_path_flags, ObexFrame, ObexHeader, ObexSession, Opcode, ResponseCode,
    TIME_FORMAT,
};

/// Boxed future used by the recursive delete.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const APP_DELETE_ALL: [u8; 2] = [0x31, 0x00];
const APP_SPACE_QUERY: [u8; 2] = [0x32, 0x01];
const SPACE_DISK: u8 = 0x01;
const SPACE_FREE: u8 = 0x02;
const APP_MOVE_COMMAND: [u8; 6] = [0x34, 0x04, b'm', b'o', b'v', b'e'];
const APP_MOVE_SOURCE: u8 = 0x35;
const APP_MOVE_TARGET: u8 = 0x36;
const MAX_MOVE_PATH: usize = 255;

/// Identity probes sent before the first OBEX switch.
const PROBE_ATTEMPTS: usize = 3;

struct Snapshot {
    current: Arc<FileMeta>,
    listing: Arc<BTreeSet<FileMeta>>,
}

/// Result of a multi-part read.
enum Received {
    Complete(Bytes),
    Interrupted(u64),
}

/// Result of a chunked write.
enum Sent {
    Complete,
    Interrupted(u64),
}

/// Navigates and transfers files on the module's flash filesystem.
pub struct FileManager {
    session: Arc<ObexSession>,
    op_lock: AsyncMutex<()>,
    snapshot: RwLock<Snapshot>,
    transfer: TransferControl,
    progress: EventHub<ProgressEvent>,
}

impl FileManager {
    /// Probe the module, switch to OBEX mode and read the root listing.
    pub async fn open(session: Arc<ObexSession>) -> Result<Self> {
        if !session.is_open() {
            let at = session.at();
            for _ in 0..PROBE_ATTEMPTS {
                at.send("AT").await?;
            }
            let identity = at.send("ATI").await?;
            tracing::info!("Module identity: {}", identity.replace("\r\n", " "));
        }

        let root = Arc::new(FileMeta::root(ROOT_DRIVE));
        let manager = Self {
            session,
            op_lock: AsyncMutex::new(()),
            snapshot: RwLock::new(Snapshot {
                current: root.clone(),
                listing: Arc::new(BTreeSet::new()),
            }),
            transfer: TransferControl::default(),
            progress: EventHub::new(),
        };

        {
            let _op = manager.op_lock.lock().await;
            manager.session.open().await?;
            manager.refresh_in(root).await?;
        }
        Ok(manager)
    }

    pub fn session(&self) -> &Arc<ObexSession> {
        &self.session
    }

    /// Cached current directory.
    pub fn current_directory(&self) -> Arc<FileMeta> {
        self.read_snapshot().current.clone()
    }

    /// Cached listing of the current directory.
    pub fn file_listing(&self) -> Arc<BTreeSet<FileMeta>> {
        self.read_snapshot().listing.clone()
    }

    pub fn add_progress_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.progress.add_listener(listener)
    }

    pub fn remove_progress_listener(&self, id: ListenerId) -> bool {
        self.progress.remove_listener(id)
    }

    /// Re-read the listing of the current directory.
    pub async fn refresh_listing(&self) -> Result<Arc<BTreeSet<FileMeta>>> {
        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;
        self.refresh().await?;
        Ok(self.file_listing())
    }

    /// Change the current directory.
    ///
    /// `path` is a drive such as `a:`, `..`, a folder name, or several of
    /// those separated by `/` or `\`.
    pub async fn change_directory(&self, path: &str) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;

        let mut current = self.current_directory();
        let mut result = Ok(());
        for (index, component) in path
            .split(|c| c == '/' || c == '\\')
            .filter(|c| !c.is_empty())
            .enumerate()
        {
            let step = if component.contains(':') {
                self.enter_drive(component).await
            } else if component == ".." {
                self.leave(&current).await
            } else {
                // Only the first step can be checked against the cached listing.
                let known = if index == 0 { self.find(component) } else { None };
                if let Some(entry) = &known {
                    if !entry.is_directory() {
                        result = Err(ModemError::InvalidArgument(format!(
                            "{} is not a directory",
                            entry.name()
                        )));
                        break;
                    }
                }
                let modified = known.and_then(|e| e.modified());
                self.enter(component, modified, &current).await
            };
            match step {
                Ok(next) => current = next,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let refreshed = self.refresh_in(current).await;
        result.and(refreshed)
    }

    /// Create a folder in the current directory.
    pub async fn make_directory(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains(|c| c == '/' || c == '\\') {
            return Err(ModemError::InvalidArgument(format!(
                "invalid folder name {:?}",
                name
            )));
        }

        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;
        if self.find(name).is_some() {
            return Err(ModemError::FilesystemConflict(format!("{} already exists", name)));
        }

        let created = self
            .session
            .expect(
                ObexFrame::set_path(set_path_flags::CREATE, Some(name)),
                &[ResponseCode::Success],
            )
            .await;
        let back = match &created {
            Ok(_) => {
                self.session
                    .expect(
                        ObexFrame::set_path(set_path_flags::PARENT, None),
                        &[ResponseCode::Success],
                    )
                    .await
            }
            Err(_) => Ok(ObexFrame::response(ResponseCode::Success)),
        };
        let refreshed = self.refresh().await;
        created.and(back).and(refreshed)
    }

    /// Delete a file or folder in the current directory.
    ///
    /// A folder with entries is only deleted when `recursive` is set; its
    /// children go first, depth-first.
    pub async fn delete_file(&self, name: &str, recursive: bool) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;
        let result = self.delete_entry(name.to_string(), recursive).await;
        let refreshed = self.refresh().await;
        result.and(refreshed)
    }

    /// Delete everything on the flash.
    pub async fn delete_all(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;

        let config = self.session.config();
        let request = ObexFrame::request(Opcode::PutFinal)
            .with_header(ObexHeader::AppParameters(Bytes::from_static(&APP_DELETE_ALL)));
        let result = self
            .session
            .lock_exchange()
            .await
            .expect_with_budget(
                request,
                &[ResponseCode::Success],
                config.delete_all_wait(),
                config.obex_wait_attempts,
            )
            .await;
        let refreshed = self.refresh().await;
        result.and(refreshed)
    }

    /// Move or rename a file. Both paths are relative to the current directory.
    pub async fn move_file(&self, old: &str, new: &str) -> Result<()> {
        let source = encode_utf16be(old);
        let target = encode_utf16be(new);
        for (path, encoded) in [(old, &source), (new, &target)] {
            if encoded.len() > MAX_MOVE_PATH {
                return Err(ModemError::InvalidArgument(format!(
                    "path {:?} is longer than {} bytes",
                    path, MAX_MOVE_PATH
                )));
            }
        }

        let mut params = BytesMut::with_capacity(APP_MOVE_COMMAND.len() + 4 + source.len() + target.len());
        params.put_slice(&APP_MOVE_COMMAND);
        params.put_u8(APP_MOVE_SOURCE);
        params.put_u8(source.len() as u8);
        params.put_slice(&source);
        params.put_u8(APP_MOVE_TARGET);
        params.put_u8(target.len() as u8);
        params.put_slice(&target);

        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;
        let request = ObexFrame::request(Opcode::PutFinal)
            .with_header(ObexHeader::AppParameters(params.freeze()));
        let result = self.session.expect(request, &[ResponseCode::Success]).await;
        let refreshed = self.refresh().await;
        result.and(refreshed)
    }

    /// Size of the flash in bytes.
    pub async fn disk_space(&self) -> Result<u64> {
        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;
        self.query_space(SPACE_DISK).await
    }

    /// Free space on the flash in bytes.
    pub async fn free_space(&self) -> Result<u64> {
        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;
        self.query_space(SPACE_FREE).await
    }

    /// Download a file from the current directory.
    pub async fn get_file(&self, name: &str) -> Result<FileContent> {
        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;

        let entry = self
            .find(name)
            .ok_or_else(|| ModemError::NotFound(name.to_string()))?;
        if entry.is_directory() {
            return Err(ModemError::InvalidArgument(format!(
                "{} is a directory",
                entry.name()
            )));
        }

        let _transfer = self.transfer.begin();
        let mut state = TransferState::new(&self.progress, Operation::GetFile, entry.size());
        state.start();

        let request = ObexFrame::request(Opcode::GetFinal)
            .with_header(ObexHeader::Name(entry.name().to_string()));
        match self.receive(request, &mut state, true).await {
            Ok(Received::Complete(data)) => {
                tracing::debug!("Read {} ({} bytes)", entry, data.len());
                state.complete();
                Ok(FileContent::from_parts(entry, data))
            }
            Ok(Received::Interrupted(bytes)) => {
                state.fail();
                if let Err(e) = self.refresh().await {
                    tracing::warn!("Could not refresh listing after cancel: {}", e);
                }
                Err(ModemError::TransferInterrupted {
                    operation: Operation::GetFile,
                    bytes_transferred: bytes,
                })
            }
            Err(e) => {
                state.fail();
                Err(e)
            }
        }
    }

    /// Upload a file into the current directory.
    ///
    /// An existing entry of the same name is a conflict unless `overwrite`
    /// is set, in which case it is deleted first.
    pub async fn put_file(&self, content: &FileContent, overwrite: bool) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open().await?;

        let name = content.name();
        let data = content.data();
        let length = u32::try_from(data.len()).map_err(|_| {
            ModemError::InvalidArgument(format!("{} is too large ({} bytes)", name, data.len()))
        })?;

        if let Some(existing) = self.find(name) {
            if !overwrite {
                return Err(ModemError::FilesystemConflict(format!(
                    "{} already exists",
                    existing.name()
                )));
            }
            self.delete_entry(existing.name().to_string(), true).await?;
            self.refresh().await?;
        }

        let free = self.query_space(SPACE_FREE).await?;
        if data.len() as u64 > free {
            return Err(ModemError::FilesystemConflict(format!(
                "{} needs {} bytes, {} free",
                name,
                data.len(),
                free
            )));
        }

        let _transfer = self.transfer.begin();
        let mut state = TransferState::new(&self.progress, Operation::PutFile, data.len() as u64);
        state.start();

        match self.send_chunks(content, length, &mut state).await {
            Ok(Sent::Complete) => {
                tracing::debug!("Wrote {} ({} bytes)", name, data.len());
                let refreshed = self.refresh().await;
                match &refreshed {
                    Ok(()) => state.complete(),
                    Err(_) => state.fail(),
                }
                refreshed
            }
            Ok(Sent::Interrupted(bytes)) => {
                if let Err(e) = self.remove_remote(name).await {
                    tracing::warn!("Could not delete partial file {}: {}", name, e);
                }
                if let Err(e) = self.refresh().await {
                    tracing::warn!("Could not refresh listing after cancel: {}", e);
                }
                state.fail();
                Err(ModemError::TransferInterrupted {
                    operation: Operation::PutFile,
                    bytes_transferred: bytes,
                })
            }
            Err(e) => {
                state.fail();
                Err(e)
            }
        }
    }

    /// Interrupt the running transfer at its next chunk boundary.
    ///
    /// Returns `Ok(false)` when no multi-part exchange is outstanding.
    /// Otherwise sends ABORT once the current chunk's exchange has finished.
    pub async fn cancel(&self) -> Result<bool> {
        let guard = self.session.lock_exchange().await;
        if !self.transfer.try_cancel() {
            return Ok(false);
        }
        tracing::debug!("Aborting transfer");
        guard
            .expect(ObexFrame::request(Opcode::Abort), &[ResponseCode::Success])
            .await?;
        Ok(true)
    }

    /// Leave OBEX mode and return the link to AT commands.
    pub async fn close(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.session.close().await
    }

    fn read_snapshot(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn replace_snapshot(&self, current: Arc<FileMeta>, listing: BTreeSet<FileMeta>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *snapshot = Snapshot {
            current,
            listing: Arc::new(listing),
        };
    }

    /// Case-insensitive lookup in the cached listing.
    fn find(&self, name: &str) -> Option<FileMeta> {
        self.file_listing()
            .iter()
            .find(|entry| entry.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Reopen OBEX mode after someone returned the link to AT commands.
    async fn ensure_open(&self) -> Result<()> {
        if self.session.is_open() {
            return Ok(());
        }
        tracing::debug!("Reopening OBEX mode");
        self.session.open().await?;
        self.refresh_in(Arc::new(FileMeta::root(ROOT_DRIVE))).await
    }

    async fn refresh(&self) -> Result<()> {
        self.refresh_in(self.current_directory()).await
    }

    /// Read the listing of the module's current folder and cache it as `current`.
    async fn refresh_in(&self, current: Arc<FileMeta>) -> Result<()> {
        let request = ObexFrame::request(Opcode::GetFinal)
            .with_header(ObexHeader::Type(FOLDER_LISTING_TYPE.to_string()));
        let mut state = TransferState::untracked(Operation::GetFile);
        let body = match self.receive(request, &mut state, false).await {
            Ok(Received::Complete(body)) => body,
            Ok(Received::Interrupted(_)) => {
                return Err(ModemError::InvalidFrame(
                    "folder listing read was interrupted".to_string(),
                ))
            }
            Err(e) => {
                // Never keep the previous folder's entries under a new directory.
                self.replace_snapshot(current, BTreeSet::new());
                return Err(e);
            }
        };

        match parse_listing(&body, &current) {
            Ok(listing) => {
                tracing::debug!("{} holds {} entries", current, listing.len());
                self.replace_snapshot(current, listing);
                Ok(())
            }
            Err(e) => {
                self.replace_snapshot(current, BTreeSet::new());
                Err(e)
            }
        }
    }

    /// Run a multi-part GET: repeat bare GET requests while the module
    /// answers CONTINUE and collect every body chunk.
    async fn receive(
        &self,
        first: ObexFrame,
        state: &mut TransferState<'_>,
        interruptible: bool,
    ) -> Result<Received> {
        let mut body = BytesMut::new();
        let mut request = first;
        loop {
            let guard = self.session.lock_exchange().await;
            if interruptible && !self.transfer.is_running() {
                return Ok(Received::Interrupted(state.transferred()));
            }

            let response = guard
                .expect(request, &[ResponseCode::Continue, ResponseCode::Success])
                .await?;
            if let Some(total) = response.length() {
                state.set_total(u64::from(total));
            }
            if let Some(chunk) = response.body() {
                body.extend_from_slice(chunk);
                state.advance(chunk.len() as u64);
            }

            if response.response_code() == Some(ResponseCode::Success) {
                if interruptible {
                    self.transfer.finish();
                }
                return Ok(Received::Complete(body.freeze()));
            }
            if interruptible {
                self.transfer.allow_interrupt();
            }
            request = ObexFrame::request(Opcode::Get);
        }
    }

    /// Send the metadata frame followed by the body in configured chunks.
    async fn send_chunks(
        &self,
        content: &FileContent,
        length: u32,
        state: &mut TransferState<'_>,
    ) -> Result<Sent> {
        let data = content.data();
        let modified = content
            .meta()
            .modified()
            .unwrap_or_else(|| chrono::Local::now().naive_local());

        let metadata = ObexFrame::request(Opcode::Put)
            .with_header(ObexHeader::Name(content.name().to_string()))
            .with_header(ObexHeader::Length(length))
            .with_header(ObexHeader::Time(modified));
        tracing::trace!("PUT {} stamped {}", content.name(), modified.format(TIME_FORMAT));
        self.session
            .expect(metadata, &[ResponseCode::Continue, ResponseCode::Success])
            .await?;
        self.transfer.allow_interrupt();

        let chunk_size = self.session.config().put_chunk_size.max(1);
        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(data.len());
            let last = end == data.len();
            let chunk = data.slice(offset..end);

            let guard = self.session.lock_exchange().await;
            if !self.transfer.is_running() {
                return Ok(Sent::Interrupted(state.transferred()));
            }

            if last {
                let frame = ObexFrame::request(Opcode::PutFinal)
                    .with_header(ObexHeader::EndOfBody(chunk));
                guard.expect(frame, &[ResponseCode::Success]).await?;
                self.transfer.finish();
                state.advance((end - offset) as u64);
                return Ok(Sent::Complete);
            }

            let frame = ObexFrame::request(Opcode::Put).with_header(ObexHeader::Body(chunk));
            guard
                .expect(frame, &[ResponseCode::Continue, ResponseCode::Success])
                .await?;
            state.advance((end - offset) as u64);
            offset = end;
        }
    }

    /// Delete `name` in the current directory, descending into folders.
    fn delete_entry(&self, name: String, recursive: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let entry = self
                .find(&name)
                .ok_or_else(|| ModemError::NotFound(name.clone()))?;

            if entry.is_directory() {
                let parent = self.current_directory();
                let folder = self.enter(entry.name(), entry.modified(), &parent).await?;
                self.refresh_in(folder.clone()).await?;

                let children = self.file_listing();
                let emptied = if children.is_empty() {
                    Ok(())
                } else if !recursive {
                    Err(ModemError::FilesystemConflict(format!(
                        "{} is not empty",
                        folder
                    )))
                } else {
                    let mut result = Ok(());
                    for child in children.iter() {
                        result = self.delete_entry(child.name().to_string(), true).await;
                        if result.is_err() {
                            break;
                        }
                    }
                    result
                };

                let parent = self.leave(&folder).await?;
                self.refresh_in(parent).await?;
                emptied?;
            }

            self.remove_remote(entry.name()).await?;
            tracing::debug!("Deleted {}", entry);
            Ok(())
        })
    }

    /// PUT-FINAL with only a NAME removes the entry on the module.
    async fn remove_remote(&self, name: &str) -> Result<()> {
        let request =
            ObexFrame::request(Opcode::PutFinal).with_header(ObexHeader::Name(name.to_string()));
        self.session.expect(request, &[ResponseCode::Success]).await?;
        Ok(())
    }

    async fn enter(
        &self,
        name: &str,
        modified: Option<chrono::NaiveDateTime>,
        current: &Arc<FileMeta>,
    ) -> Result<Arc<FileMeta>> {
        self.session
            .expect(
                ObexFrame::set_path(set_path_flags::NO_CREATE, Some(name)),
                &[ResponseCode::Success],
            )
            .await?;
        Ok(Arc::new(FileMeta::directory(name, modified, current.clone())))
    }

    async fn leave(&self, current: &Arc<FileMeta>) -> Result<Arc<FileMeta>> {
        let parent = current
            .parent()
            .cloned()
            .ok_or_else(|| ModemError::InvalidArgument(format!("{} has no parent", current)))?;
        self.session
            .expect(
                ObexFrame::set_path(set_path_flags::PARENT, None),
                &[ResponseCode::Success],
            )
            .await?;
        Ok(parent)
    }

    async fn enter_drive(&self, drive: &str) -> Result<Arc<FileMeta>> {
        let root = FileMeta::root(drive);
        self.session
            .expect(
                ObexFrame::set_path(set_path_flags::NO_CREATE, Some(root.name())),
                &[ResponseCode::Success],
            )
            .await?;
        Ok(Arc::new(root))
    }

    async fn query_space(&self, selector: u8) -> Result<u64> {
        let mut params = BytesMut::with_capacity(3);
        params.put_slice(&APP_SPACE_QUERY);
        params.put_u8(selector);
        let request = ObexFrame::request(Opcode::PutFinal)
            .with_header(ObexHeader::AppParameters(params.freeze()));

        let response = self.session.expect(request, &[ResponseCode::Success]).await?;
        let payload = response.app_parameters().ok_or_else(|| {
            ModemError::InvalidFrame("space query response without APP_PARAMETERS".to_string())
        })?;
        let value = payload
            .get(2..6)
            .ok_or_else(|| {
                ModemError::InvalidFrame(format!(
                    "space query result too short ({} bytes)",
                    payload.len()
                ))
            })?;
        Ok(u64::from(u32::from_be_bytes([value[0], value[1], value[2], value[3]])))
    }
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("current", &self.current_directory().path())
            .field("entries", &self.file_listing().len())
            .finish()
    }
}
