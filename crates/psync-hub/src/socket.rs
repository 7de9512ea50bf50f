use chrono::Utc;
use psync_core::bus::BusEvent;
use psync_core::wire::{
    decode_frame, encode_frame, CommandError, CommandPayload, CommandResultPayload,
    ProtocolVersion, SnapshotPayload, WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES,
};
use psync_core::ChannelId;
use psync_engine::{resync, SnapshotSource, SyncContext, SyncError};
use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
#[cfg(unix)]
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{mpsc, watch, RwLock},
};
use tracing::{debug, info, warn};

const HUB_SENDER_ID: &str = "psync-hub";

#[derive(Clone, Debug)]
pub struct HubSocketConfig {
    pub company_id: String,
    pub socket_path: PathBuf,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

#[cfg(not(unix))]
pub async fn run<S: SnapshotSource>(
    _config: HubSocketConfig,
    _ctx: SyncContext,
    _source: Arc<S>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

#[cfg(unix)]
pub async fn run<S: SnapshotSource>(
    config: HubSocketConfig,
    ctx: SyncContext,
    source: Arc<S>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    if config.socket_path.exists() {
        let _ = fs::remove_file(&config.socket_path);
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));

    let hub = Arc::new(ProgressHub::new(config.clone(), ctx, source));
    hub.clone().spawn_event_relay(shutdown.clone());

    info!(
        event = "hub_socket_start",
        company_id = %config.company_id,
        socket = %config.socket_path.display(),
        queue_capacity = config.queue_capacity
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let hub = hub.clone();
                        tokio::spawn(async move {
                            hub.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "hub_socket_accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&config.socket_path);
    info!(event = "hub_socket_stop", company_id = %config.company_id);
    Ok(())
}

#[cfg(unix)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientRole {
    Publisher,
    Subscriber,
}

#[cfg(unix)]
#[derive(Clone)]
struct ClientEntry {
    conn_id: String,
    role: ClientRole,
    sender: mpsc::Sender<WireEnvelope>,
}

#[cfg(unix)]
struct ProgressHub<S> {
    config: HubSocketConfig,
    ctx: SyncContext,
    source: Arc<S>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, ClientEntry>>,
    subscribers: RwLock<HashMap<String, mpsc::Sender<WireEnvelope>>>,
}

#[cfg(unix)]
impl<S: SnapshotSource> ProgressHub<S> {
    fn new(config: HubSocketConfig, ctx: SyncContext, source: Arc<S>) -> Self {
        Self {
            config,
            ctx,
            source,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("psync-conn-{id}")
    }

    fn make_envelope(&self, request_id: Option<String>, msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion(CURRENT_PROTOCOL_VERSION),
            company_id: self.config.company_id.clone(),
            sender_id: HUB_SENDER_ID.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }

    async fn register_client(&self, client: ClientEntry) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        if client.role == ClientRole::Subscriber {
            self.subscribers
                .write()
                .await
                .insert(client.conn_id.clone(), client.sender.clone());
        }
        info!(
            event = "hub_client_connected",
            conn_id = %client.conn_id,
            role = ?client.role
        );
    }

    async fn unregister_client(&self, conn_id: &str) {
        let client = self.clients.write().await.remove(conn_id);
        if client.is_some() {
            self.subscribers.write().await.remove(conn_id);
            info!(event = "hub_client_disconnected", conn_id = conn_id);
        }
    }

    fn build_snapshot_envelope(&self) -> WireEnvelope {
        let records = ChannelId::ALL
            .into_iter()
            .map(|channel| self.ctx.record(channel))
            .collect();
        let open_modals = ChannelId::ALL
            .into_iter()
            .filter(|channel| self.ctx.modal_open(*channel))
            .collect();
        self.make_envelope(
            None,
            WireMsg::Snapshot(SnapshotPayload {
                records,
                open_modals,
            }),
        )
    }

    /// Forwards every bus event of the hub context to connected subscribers.
    fn spawn_event_relay(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.ctx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        self.broadcast_event(event).await;
                    }
                }
            }
        });
    }

    async fn broadcast_event(&self, event: BusEvent) {
        let envelope = self.make_envelope(None, WireMsg::Event(event));
        let subscribers = self.subscribers.read().await.clone();
        let mut slow = Vec::new();

        for (conn_id, sender) in subscribers {
            match sender.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(conn_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "hub_slow_consumer", conn_id = %conn_id);
                    slow.push(conn_id);
                }
            }
        }

        for conn_id in slow {
            self.unregister_client(&conn_id).await;
        }
    }

    async fn send_to_conn(&self, conn_id: &str, envelope: WireEnvelope) -> bool {
        let sender = {
            let clients = self.clients.read().await;
            clients.get(conn_id).map(|c| c.sender.clone())
        };
        let Some(sender) = sender else {
            return false;
        };

        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister_client(conn_id).await;
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "hub_send_backpressure", conn_id = %conn_id);
                self.unregister_client(conn_id).await;
                false
            }
        }
    }

    async fn route_command(&self, conn_id: &str, request_id: Option<String>, payload: CommandPayload) {
        let command = payload.command.trim().to_lowercase();
        let Some(channel) = payload.channel else {
            self.send_command_error(
                conn_id,
                request_id,
                &command,
                "missing_channel",
                "command requires a channel",
            )
            .await;
            return;
        };

        let result = match command.as_str() {
            "dismiss" => self.ctx.dismiss(channel).map(|()| "dismissed".to_string()),
            "open_modal" => self.ctx.open_modal(channel).map(|()| "modal opened".to_string()),
            "close_modal" => self.ctx.close_modal(channel).map(|()| "modal closed".to_string()),
            "acknowledge" => match self.ctx.acknowledge(channel) {
                Ok(true) => Ok("acknowledged".to_string()),
                Ok(false) => {
                    self.send_command_error(
                        conn_id,
                        request_id,
                        &command,
                        "not_completed",
                        "operation has not completed",
                    )
                    .await;
                    return;
                }
                Err(err) => Err(err),
            },
            "resync" => resync(&self.ctx, self.source.as_ref(), channel)
                .await
                .map(|outcome| format!("resync {:?}", outcome.effect).to_lowercase()),
            other => {
                self.send_command_error(
                    conn_id,
                    request_id,
                    other,
                    "unsupported_command",
                    "unsupported command",
                )
                .await;
                return;
            }
        };

        match result {
            Ok(message) => {
                info!(
                    event = "hub_command",
                    conn_id = %conn_id,
                    command = %command,
                    channel = %channel
                );
                self.send_command_result(conn_id, request_id, &command, "ok", &message, None)
                    .await;
            }
            Err(err) => {
                warn!(
                    event = "hub_command_error",
                    conn_id = %conn_id,
                    command = %command,
                    channel = %channel,
                    error = %err
                );
                let code = match err {
                    SyncError::NoOperation(_) => "no_operation",
                    SyncError::Fetch(_) => "fetch_failed",
                    _ => "internal_error",
                };
                self.send_command_error(conn_id, request_id, &command, code, &err.to_string())
                    .await;
            }
        }
    }

    async fn send_command_error(
        &self,
        conn_id: &str,
        request_id: Option<String>,
        command: &str,
        code: &str,
        message: &str,
    ) {
        self.send_command_result(
            conn_id,
            request_id,
            command,
            "error",
            message,
            Some(CommandError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        )
        .await;
    }

    async fn send_command_result(
        &self,
        conn_id: &str,
        request_id: Option<String>,
        command: &str,
        status: &str,
        message: &str,
        error: Option<CommandError>,
    ) {
        let envelope = self.make_envelope(
            request_id,
            WireMsg::CommandResult(CommandResultPayload {
                command: command.to_string(),
                status: status.to_string(),
                message: Some(message.to_string()),
                error,
            }),
        );
        self.send_to_conn(conn_id, envelope).await;
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn_id();
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        let Some(hello) = read_next_valid_frame(&mut reader).await else {
            return;
        };

        if hello.version.0 > CURRENT_PROTOCOL_VERSION {
            warn!(
                event = "hub_unsupported_version",
                conn_id = %conn_id,
                version = hello.version.0
            );
            return;
        }
        if hello.company_id != self.config.company_id {
            warn!(
                event = "hub_company_mismatch",
                conn_id = %conn_id,
                msg_company = %hello.company_id,
                expected_company = %self.config.company_id
            );
            return;
        }

        let WireMsg::Hello(payload) = hello.msg else {
            warn!(event = "hub_expected_hello", conn_id = %conn_id);
            return;
        };

        let role = match payload.role.as_str() {
            "publisher" => ClientRole::Publisher,
            "subscriber" => ClientRole::Subscriber,
            _ => {
                warn!(event = "hub_invalid_role", conn_id = %conn_id, role = %payload.role);
                return;
            }
        };

        let (tx, rx) = mpsc::channel::<WireEnvelope>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let conn_for_writer = conn_id.clone();
        let writer_task = tokio::spawn(async move {
            writer_loop(conn_for_writer, writer_half, rx, write_timeout).await;
        });

        self.register_client(ClientEntry {
            conn_id: conn_id.clone(),
            role,
            sender: tx.clone(),
        })
        .await;

        if role == ClientRole::Subscriber {
            let _ = tx.send(self.build_snapshot_envelope()).await;
        }

        loop {
            let Some(envelope) = read_next_valid_frame(&mut reader).await else {
                break;
            };
            if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
                warn!(
                    event = "hub_skip_version",
                    conn_id = %conn_id,
                    version = envelope.version.0
                );
                continue;
            }
            if envelope.company_id != self.config.company_id {
                warn!(
                    event = "hub_message_company_mismatch",
                    conn_id = %conn_id,
                    msg_company = %envelope.company_id,
                    expected_company = %self.config.company_id
                );
                break;
            }

            match (role, envelope.msg) {
                (ClientRole::Publisher, WireMsg::Push(mut push)) => {
                    if push.company_id.is_none() {
                        push.company_id = Some(envelope.company_id.clone());
                    }
                    match self.ctx.ingest_push(&push) {
                        Ok(Some(outcome)) => {
                            debug!(
                                event = "hub_push_merged",
                                conn_id = %conn_id,
                                kind = %push.kind,
                                effect = ?outcome.effect
                            );
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(
                                event = "hub_push_rejected",
                                conn_id = %conn_id,
                                kind = %push.kind,
                                error = %err
                            );
                        }
                    }
                }
                (ClientRole::Subscriber, WireMsg::Command(payload)) => {
                    self.route_command(&conn_id, envelope.request_id, payload)
                        .await;
                }
                (_, WireMsg::Hello(_)) => {
                    warn!(event = "hub_unexpected_hello", conn_id = %conn_id);
                }
                _ => {
                    debug!(event = "hub_ignored_message", conn_id = %conn_id);
                }
            }
        }

        self.unregister_client(&conn_id).await;
        drop(tx);
        let _ = writer_task.await;
    }
}

#[cfg(unix)]
async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WireEnvelope>,
    write_timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_encode_error", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "hub_write_error", conn_id = %conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "hub_write_timeout", conn_id = %conn_id);
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn read_next_valid_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<WireEnvelope> {
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<WireEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(envelope) => return Some(envelope),
            Err(err) => {
                warn!(event = "hub_decode_error", error = %err);
                continue;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::source::LedgerSource;
    use psync_core::config::SyncConfig;
    use psync_core::push::{PushEnvelope, CAMPAIGN_STARTED, IMPORT_PROGRESS, MESSAGE_UPDATED};
    use psync_core::wire::HelloPayload;
    use psync_core::OperationStatus;
    use psync_storage::{OperationLedger, OperationRow, StoreHub};
    use serde_json::json;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    const COMPANY: &str = "company-7";

    fn test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("psync-hub-test-{name}-{nanos}"))
            .join("hub.sock")
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("socket did not appear: {}", path.display());
    }

    fn envelope(company: &str, sender: &str, request_id: Option<&str>, msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            company_id: company.to_string(),
            sender_id: sender.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: request_id.map(str::to_string),
            msg,
        }
    }

    fn hello(company: &str, sender: &str, role: &str) -> WireEnvelope {
        envelope(
            company,
            sender,
            None,
            WireMsg::Hello(HelloPayload {
                client_id: sender.to_string(),
                role: role.to_string(),
            }),
        )
    }

    fn push(kind: &str, data: serde_json::Value) -> WireEnvelope {
        envelope(COMPANY, "dispatcher", None, WireMsg::Push(PushEnvelope::new(kind, data)))
    }

    fn command(request_id: &str, command: &str, channel: Option<ChannelId>) -> WireEnvelope {
        envelope(
            COMPANY,
            "dashboard",
            Some(request_id),
            WireMsg::Command(CommandPayload {
                command: command.to_string(),
                channel,
            }),
        )
    }

    async fn connect_client(
        path: &Path,
        hello: WireEnvelope,
    ) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = UnixStream::connect(path)
            .await
            .unwrap_or_else(|err| panic!("connect failed: {err}"));
        let (reader, mut writer) = stream.into_split();
        send_frame(&mut writer, &hello).await;
        (BufReader::new(reader), writer)
    }

    async fn send_frame(writer: &mut OwnedWriteHalf, envelope: &WireEnvelope) {
        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        writer.write_all(&frame).await.expect("write");
        writer.flush().await.expect("flush");
    }

    async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> WireEnvelope {
        let mut line = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
                .await
                .expect("read timeout")
                .expect("read error");
        assert!(read > 0, "unexpected EOF");
        decode_frame(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode")
    }

    /// Reads frames until one matches, skipping unrelated events.
    async fn read_until<T>(
        reader: &mut BufReader<OwnedReadHalf>,
        mut pick: impl FnMut(WireEnvelope) -> Option<T>,
    ) -> T {
        for _ in 0..32 {
            if let Some(found) = pick(read_frame(reader).await) {
                return found;
            }
        }
        panic!("expected frame never arrived");
    }

    struct LaunchedHub {
        path: PathBuf,
        ctx: SyncContext,
        ledger: Arc<OperationLedger>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<io::Result<()>>,
    }

    impl LaunchedHub {
        async fn stop(self) {
            let _ = self.shutdown.send(true);
            let result = self.handle.await.expect("join hub");
            assert!(result.is_ok(), "hub returned error: {result:?}");
        }
    }

    async fn launch_hub(name: &str) -> LaunchedHub {
        let path = test_path(name);
        let config = SyncConfig {
            company_id: COMPANY.to_string(),
            ..SyncConfig::default()
        };
        let ctx = SyncContext::new(StoreHub::in_memory().context("hub"), config);
        let ledger = Arc::new(OperationLedger::open_in_memory().expect("ledger"));
        let source = Arc::new(LedgerSource::new(ledger.clone()));
        let cfg = HubSocketConfig {
            company_id: COMPANY.to_string(),
            socket_path: path.clone(),
            write_timeout: Duration::from_secs(1),
            queue_capacity: 32,
        };
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(cfg, ctx.clone(), source, rx));
        wait_for_socket(&path).await;
        LaunchedHub {
            path,
            ctx,
            ledger,
            shutdown: tx,
            handle,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_on_connect_then_progress_events() {
        let hub = launch_hub("snapshot-events").await;

        let (_pub_reader, mut pub_writer) =
            connect_client(&hub.path, hello(COMPANY, "dispatcher", "publisher")).await;
        send_frame(
            &mut pub_writer,
            &push(CAMPAIGN_STARTED, json!({"schedule_id": 42, "total": 2})),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (mut sub_reader, _sub_writer) =
            connect_client(&hub.path, hello(COMPANY, "dashboard", "subscriber")).await;
        let WireMsg::Snapshot(snapshot) = read_frame(&mut sub_reader).await.msg else {
            panic!("expected snapshot")
        };
        assert_eq!(snapshot.records.len(), 3);
        let campaign = snapshot
            .records
            .iter()
            .find(|record| record.channel_id == ChannelId::Campaign)
            .expect("campaign record");
        assert!(campaign.is_processing);
        assert_eq!(campaign.total, 2);
        assert_eq!(snapshot.open_modals, vec![ChannelId::Campaign]);

        send_frame(
            &mut pub_writer,
            &push(
                MESSAGE_UPDATED,
                json!({"schedule_id": 42, "message_id": "m1", "status": "sent", "contact_name": "Ana"}),
            ),
        )
        .await;

        let record = read_until(&mut sub_reader, |frame| match frame.msg {
            WireMsg::Event(BusEvent::ProgressUpdated { record, .. }) => Some(record),
            _ => None,
        })
        .await;
        assert_eq!(record.successful, 1);
        assert_eq!(record.recent_items[0].label, "Ana");

        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dismiss_command_clears_and_acks() {
        let hub = launch_hub("dismiss").await;
        hub.ctx
            .ingest_push(&PushEnvelope::new(
                IMPORT_PROGRESS,
                json!({"status": "processing", "total": 50, "processed": 30, "successful": 30}),
            ))
            .expect("seed progress");

        let (mut sub_reader, mut sub_writer) =
            connect_client(&hub.path, hello(COMPANY, "dashboard", "subscriber")).await;
        let _snapshot = read_frame(&mut sub_reader).await;

        send_frame(
            &mut sub_writer,
            &command("req-1", "dismiss", Some(ChannelId::Import)),
        )
        .await;
        let (request_id, result) = read_until(&mut sub_reader, |frame| match frame.msg {
            WireMsg::CommandResult(result) => Some((frame.request_id, result)),
            _ => None,
        })
        .await;
        assert_eq!(request_id.as_deref(), Some("req-1"));
        assert_eq!(result.status, "ok");
        assert!(hub.ctx.record(ChannelId::Import).is_idle());

        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resync_reads_ledger_and_completes_operation() {
        let hub = launch_hub("resync").await;
        hub.ctx
            .start_operation(
                ChannelId::Import,
                Some("job-5".to_string()),
                10,
                psync_core::ChannelMeta::None,
            )
            .expect("start");
        hub.ledger
            .record_status(&OperationRow {
                operation_id: "job-5".to_string(),
                channel: ChannelId::Import,
                total_count: Some(10),
                processed_count: 10,
                successful_count: 9,
                failed_count: 1,
                status: OperationStatus::Completed,
                updated_at: Utc::now(),
            })
            .expect("ledger row");

        let (mut sub_reader, mut sub_writer) =
            connect_client(&hub.path, hello(COMPANY, "dashboard", "subscriber")).await;
        let _snapshot = read_frame(&mut sub_reader).await;
        send_frame(
            &mut sub_writer,
            &command("req-2", "resync", Some(ChannelId::Import)),
        )
        .await;
        let result = read_until(&mut sub_reader, |frame| match frame.msg {
            WireMsg::CommandResult(result) => Some(result),
            _ => None,
        })
        .await;
        assert_eq!(result.status, "ok");
        let record = hub.ctx.record(ChannelId::Import);
        assert!(!record.is_processing);
        assert_eq!(record.outcome, Some(OperationStatus::Completed));

        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn command_errors_include_code_and_message() {
        let hub = launch_hub("command-errors").await;
        let (mut sub_reader, mut sub_writer) =
            connect_client(&hub.path, hello(COMPANY, "dashboard", "subscriber")).await;
        let _snapshot = read_frame(&mut sub_reader).await;

        send_frame(&mut sub_writer, &command("req-3", "dismiss", None)).await;
        let missing = read_until(&mut sub_reader, |frame| match frame.msg {
            WireMsg::CommandResult(result) => Some(result),
            _ => None,
        })
        .await;
        assert_eq!(missing.status, "error");
        assert_eq!(
            missing.error.expect("error").code,
            "missing_channel".to_string()
        );

        send_frame(
            &mut sub_writer,
            &command("req-4", "acknowledge", Some(ChannelId::Campaign)),
        )
        .await;
        let idle = read_until(&mut sub_reader, |frame| match frame.msg {
            WireMsg::CommandResult(result) => Some(result),
            _ => None,
        })
        .await;
        assert_eq!(idle.error.expect("error").code, "not_completed");

        send_frame(
            &mut sub_writer,
            &command("req-5", "cancel", Some(ChannelId::Campaign)),
        )
        .await;
        let unsupported = read_until(&mut sub_reader, |frame| match frame.msg {
            WireMsg::CommandResult(result) => Some(result),
            _ => None,
        })
        .await;
        assert_eq!(unsupported.error.expect("error").code, "unsupported_command");

        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_other_company_publishers() {
        let hub = launch_hub("company-scope").await;

        let (_rogue_reader, mut rogue_writer) =
            connect_client(&hub.path, hello("company-9", "rogue", "publisher")).await;
        let mut rogue_push = push(IMPORT_PROGRESS, json!({"status": "processing", "total": 5}));
        rogue_push.company_id = "company-9".to_string();
        if let Ok(frame) = encode_frame(&rogue_push, DEFAULT_MAX_FRAME_BYTES) {
            let _ = rogue_writer.write_all(&frame).await;
            let _ = rogue_writer.flush().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (mut sub_reader, _sub_writer) =
            connect_client(&hub.path, hello(COMPANY, "dashboard", "subscriber")).await;
        let WireMsg::Snapshot(snapshot) = read_frame(&mut sub_reader).await.msg else {
            panic!("expected snapshot")
        };
        assert!(snapshot.records.iter().all(|record| record.is_idle()));

        hub.stop().await;
    }
}
