use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, ProgressSink};
use crate::error::{ClientError, ClientResult};
use crate::models::JobProgress;

const JOB_ID_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub const QUEUED_STATUS: &str = "File queued for reading...";
pub const PROCESSING_STATUS: &str = "Splitting into paragraphs and embedding...";

#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

impl UploadFile {
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("file")
            .to_string();
        Ok(UploadFile { name, path: path.to_path_buf(), size: metadata.len() })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Started { job_id: String, file_name: String },
    Progress(ProgressView),
    Succeeded(String),
    Failed(String),
    /// Affordances may be re-enabled. Sent on every exit path.
    Released,
}

/// What the progress bar shows.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressView {
    pub percent: u8,
    pub status: Option<String>,
    pub server_side: bool,
}

/// Merge the bytes-sent channel with the polled server channel.
///
/// Once the server reports any progress or status it takes over for the rest
/// of the job, even over a client update that arrives later; before that the
/// transfer percentage is shown.
pub fn merge_progress(
    client_pct: Option<u8>,
    server_pct: Option<u8>,
    server_status: Option<&str>,
) -> ProgressView {
    let status = server_status.map(str::trim).filter(|s| !s.is_empty());
    let server_started = server_pct.map(|p| p > 0).unwrap_or(false) || status.is_some();

    if server_started {
        return ProgressView {
            percent: server_pct.unwrap_or(0).min(100),
            status: Some(status.unwrap_or(PROCESSING_STATUS).to_string()),
            server_side: true,
        };
    }

    let percent = client_pct.unwrap_or(0).min(100);
    ProgressView {
        percent,
        status: (percent >= 100).then(|| QUEUED_STATUS.to_string()),
        server_side: false,
    }
}

pub fn new_job_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..JOB_ID_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("job_{}", suffix)
}

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_bytes: u64,
    /// Skip the size check (server is on a trusted local host).
    pub bypass_size_check: bool,
    pub poll_interval: Duration,
    pub cleanup_grace: Duration,
}

impl UploadLimits {
    pub fn check(&self, file: &UploadFile) -> ClientResult<()> {
        if !self.bypass_size_check && file.size > self.max_bytes {
            return Err(ClientError::FileTooLarge { size: file.size, max: self.max_bytes });
        }
        Ok(())
    }
}

/// Network side of an upload. `ApiClient` is the real one.
pub trait UploadBackend: Send + Sync + 'static {
    fn upload<'a>(
        &'a self,
        file: &'a UploadFile,
        job_id: &'a str,
        on_progress: ProgressSink,
    ) -> BoxFuture<'a, ClientResult<String>>;

    fn poll_progress<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, ClientResult<JobProgress>>;
}

impl UploadBackend for ApiClient {
    fn upload<'a>(
        &'a self,
        file: &'a UploadFile,
        job_id: &'a str,
        on_progress: ProgressSink,
    ) -> BoxFuture<'a, ClientResult<String>> {
        Box::pin(ApiClient::upload(self, file, job_id, on_progress))
    }

    fn poll_progress<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, ClientResult<JobProgress>> {
        Box::pin(self.progress(job_id))
    }
}

enum Signal {
    Client(u8),
    Server(JobProgress),
}

/// Restores affordances when the submission ends, however it ends.
struct InFlightGuard {
    flag: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<UploadEvent>,
    poller: CancellationToken,
    grace: Duration,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        let _ = self.events.send(UploadEvent::Released);

        let poller = self.poller.clone();
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    poller.cancel();
                });
            }
            Err(_) => poller.cancel(),
        }
    }
}

/// Drives one upload at a time and merges its two progress channels.
pub struct UploadCoordinator<B: UploadBackend> {
    backend: Arc<B>,
    limits: UploadLimits,
    in_flight: Arc<AtomicBool>,
}

impl<B: UploadBackend> Clone for UploadCoordinator<B> {
    fn clone(&self) -> Self {
        UploadCoordinator {
            backend: self.backend.clone(),
            limits: self.limits.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<B: UploadBackend> UploadCoordinator<B> {
    pub fn new(backend: Arc<B>, limits: UploadLimits) -> Self {
        UploadCoordinator { backend, limits, in_flight: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Upload `file`, streaming progress into `events`. Returns the server's
    /// success message. Terminal events are sent before returning.
    pub async fn submit(
        &self,
        file: UploadFile,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> ClientResult<String> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!(file = %file.name, "upload already in progress, rejecting");
            return Err(ClientError::Busy);
        }

        let poller = CancellationToken::new();
        let _guard = InFlightGuard {
            flag: self.in_flight.clone(),
            events: events.clone(),
            poller: poller.clone(),
            grace: self.limits.cleanup_grace,
        };

        let result = self.run(&file, &events, poller).await;
        match &result {
            Ok(message) => {
                tracing::info!(file = %file.name, "upload finished");
                let _ = events.send(UploadEvent::Succeeded(message.clone()));
            }
            Err(err) => {
                tracing::error!(file = %file.name, error = %err, "upload failed");
                let _ = events.send(UploadEvent::Failed(err.user_message()));
            }
        }
        result
    }

    async fn run(
        &self,
        file: &UploadFile,
        events: &mpsc::UnboundedSender<UploadEvent>,
        poller: CancellationToken,
    ) -> ClientResult<String> {
        self.limits.check(file)?;

        let job_id = new_job_id();
        tracing::info!(file = %file.name, job_id = %job_id, size = file.size, "starting upload");
        let _ = events.send(UploadEvent::Started {
            job_id: job_id.clone(),
            file_name: file.name.clone(),
        });
        let _ = events.send(UploadEvent::Progress(merge_progress(Some(0), None, None)));

        let (signal_tx, mut signals) = mpsc::unbounded_channel::<Signal>();

        tokio::spawn(poll_loop(
            self.backend.clone(),
            job_id.clone(),
            self.limits.poll_interval,
            signal_tx.clone(),
            poller,
        ));

        // Only report when the rounded percentage changes.
        let last_pct = Arc::new(Mutex::new(None::<u8>));
        let client_tx = signal_tx;
        let on_progress: ProgressSink = Arc::new(move |sent, total| {
            let pct = if total == 0 {
                100
            } else {
                ((sent as f64 / total as f64) * 100.0).round() as u8
            };
            if let Ok(mut last) = last_pct.lock() {
                if *last != Some(pct) {
                    *last = Some(pct);
                    let _ = client_tx.send(Signal::Client(pct));
                }
            }
        });

        let upload = self.backend.upload(file, &job_id, on_progress);
        tokio::pin!(upload);

        let mut client_pct: Option<u8> = None;
        let mut server: Option<JobProgress> = None;

        loop {
            tokio::select! {
                result = &mut upload => return result,
                Some(signal) = signals.recv() => {
                    match signal {
                        Signal::Client(pct) => client_pct = Some(pct),
                        Signal::Server(progress) => server = Some(progress),
                    }
                    let view = merge_progress(
                        client_pct,
                        server.as_ref().map(JobProgress::percent),
                        server.as_ref().and_then(JobProgress::status_text),
                    );
                    let _ = events.send(UploadEvent::Progress(view));
                }
            }
        }
    }
}

async fn poll_loop<B: UploadBackend>(
    backend: Arc<B>,
    job_id: String,
    interval: Duration,
    signals: mpsc::UnboundedSender<Signal>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match backend.poll_progress(&job_id).await {
            Ok(progress) => {
                let done = progress.percent() >= 100;
                tracing::debug!(job_id = %job_id, progress = progress.percent(), "server progress");
                if signals.send(Signal::Server(progress)).is_err() || done {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "progress poll failed");
            }
        }
    }
    tracing::debug!(job_id = %job_id, "progress polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeBackend {
        uploads: AtomicUsize,
        polls: AtomicUsize,
        upload_delay: Duration,
        upload_result: Result<String, String>,
        progress_script: Vec<JobProgress>,
        report_bytes: bool,
    }

    impl FakeBackend {
        fn new(upload_delay: Duration) -> Self {
            FakeBackend {
                uploads: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
                upload_delay,
                upload_result: Ok("'report.pdf' uploaded and 12 paragraphs indexed.".to_string()),
                progress_script: Vec::new(),
                report_bytes: false,
            }
        }
    }

    impl UploadBackend for FakeBackend {
        fn upload<'a>(
            &'a self,
            file: &'a UploadFile,
            _job_id: &'a str,
            on_progress: ProgressSink,
        ) -> BoxFuture<'a, ClientResult<String>> {
            Box::pin(async move {
                self.uploads.fetch_add(1, Ordering::SeqCst);
                if self.report_bytes {
                    on_progress(file.size / 2, file.size);
                    on_progress(file.size, file.size);
                }
                tokio::time::sleep(self.upload_delay).await;
                self.upload_result.clone().map_err(ClientError::Application)
            })
        }

        fn poll_progress<'a>(&'a self, _job_id: &'a str) -> BoxFuture<'a, ClientResult<JobProgress>> {
            Box::pin(async move {
                let n = self.polls.fetch_add(1, Ordering::SeqCst);
                let last = self.progress_script.last().cloned().unwrap_or_default();
                Ok(self.progress_script.get(n).cloned().unwrap_or(last))
            })
        }
    }

    fn limits(max_bytes: u64, bypass: bool) -> UploadLimits {
        UploadLimits {
            max_bytes,
            bypass_size_check: bypass,
            poll_interval: Duration::from_millis(10),
            cleanup_grace: Duration::from_millis(10),
        }
    }

    fn file(size: u64) -> UploadFile {
        UploadFile { name: "report.pdf".into(), path: PathBuf::from("report.pdf"), size }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn merge_prefers_client_until_server_starts() {
        let view = merge_progress(Some(40), None, None);
        assert_eq!(view.percent, 40);
        assert_eq!(view.status, None);
        assert!(!view.server_side);

        let view = merge_progress(Some(100), Some(0), None);
        assert_eq!(view.percent, 100);
        assert_eq!(view.status.as_deref(), Some(QUEUED_STATUS));

        let view = merge_progress(Some(100), Some(15), None);
        assert_eq!(view.percent, 15);
        assert_eq!(view.status.as_deref(), Some(PROCESSING_STATUS));
        assert!(view.server_side);
    }

    #[test]
    fn merge_uses_server_status_text_even_at_zero() {
        let view = merge_progress(Some(70), Some(0), Some("Reading PDF pages"));
        assert_eq!(view.percent, 0);
        assert_eq!(view.status.as_deref(), Some("Reading PDF pages"));
        assert!(view.server_side);
    }

    #[test]
    fn job_ids_are_prefixed_base36() {
        let id = new_job_id();
        assert!(id.starts_with("job_"));
        assert_eq!(id.len(), 4 + JOB_ID_LEN);
        assert!(id[4..].bytes().all(|b| BASE36.contains(&b)));
        assert_ne!(new_job_id(), new_job_id());
    }

    #[test]
    fn size_limit_applies_unless_bypassed() {
        let max = 99 * 1024 * 1024;
        assert!(limits(max, false).check(&file(max)).is_ok());
        assert!(matches!(
            limits(max, false).check(&file(max + 1)),
            Err(ClientError::FileTooLarge { .. })
        ));
        assert!(limits(max, true).check(&file(max * 3)).is_ok());
    }

    #[tokio::test]
    async fn oversized_file_never_reaches_the_network() {
        let backend = Arc::new(FakeBackend::new(Duration::ZERO));
        let coordinator = UploadCoordinator::new(backend.clone(), limits(1000, false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = coordinator.submit(file(1001), tx).await;

        assert!(matches!(result, Err(ClientError::FileTooLarge { size: 1001, max: 1000 })));
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_busy());
        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(UploadEvent::Failed(_))));
        assert_eq!(events.last(), Some(&UploadEvent::Released));
    }

    #[tokio::test]
    async fn second_submission_is_rejected_while_first_is_pending() {
        let backend = Arc::new(FakeBackend::new(Duration::from_millis(100)));
        let coordinator = UploadCoordinator::new(backend.clone(), limits(1000, false));
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = {
            let coordinator = coordinator.clone();
            let tx = tx.clone();
            tokio::spawn(async move { coordinator.submit(file(10), tx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.is_busy());

        let second = coordinator.submit(file(10), tx).await;
        assert!(matches!(second, Err(ClientError::Busy)));

        assert!(first.await.unwrap().is_ok());
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn failure_still_releases_affordances() {
        let mut backend = FakeBackend::new(Duration::from_millis(5));
        backend.upload_result = Err("unsupported file type".to_string());
        let coordinator = UploadCoordinator::new(Arc::new(backend), limits(1000, false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = coordinator.submit(file(10), tx).await;

        assert!(matches!(result, Err(ClientError::Application(_))));
        assert!(!coordinator.is_busy());
        let events = drain(&mut rx);
        assert!(events.contains(&UploadEvent::Failed("Error: unsupported file type".to_string())));
        assert_eq!(events.last(), Some(&UploadEvent::Released));
    }

    #[tokio::test]
    async fn cancelled_submission_releases_the_slot() {
        let backend = Arc::new(FakeBackend::new(Duration::from_secs(60)));
        let coordinator = UploadCoordinator::new(backend, limits(1000, false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let pending = tokio::time::timeout(Duration::from_millis(20), coordinator.submit(file(10), tx)).await;

        assert!(pending.is_err());
        assert!(!coordinator.is_busy());
        assert_eq!(drain(&mut rx).last(), Some(&UploadEvent::Released));
    }

    #[tokio::test]
    async fn polling_stops_at_one_hundred_without_client_progress() {
        let mut backend = FakeBackend::new(Duration::from_millis(200));
        backend.progress_script = vec![
            JobProgress { progress: 40.0, status: Some("Embedding".into()) },
            JobProgress { progress: 100.0, status: Some("Done".into()) },
        ];
        let backend = Arc::new(backend);
        let coordinator = UploadCoordinator::new(backend.clone(), limits(1000, false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        coordinator.submit(file(10), tx).await.unwrap();

        assert_eq!(backend.polls.load(Ordering::SeqCst), 2);
        let progress: Vec<ProgressView> = drain(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                UploadEvent::Progress(view) => Some(view),
                _ => None,
            })
            .collect();
        let last = progress.last().unwrap();
        assert_eq!(last.percent, 100);
        assert_eq!(last.status.as_deref(), Some("Done"));
    }

    #[tokio::test]
    async fn polling_stops_after_grace_when_job_settles_below_one_hundred() {
        let mut backend = FakeBackend::new(Duration::from_millis(35));
        backend.upload_result = Err("parser crashed".to_string());
        let backend = Arc::new(backend);
        let limits = UploadLimits {
            max_bytes: 1000,
            bypass_size_check: false,
            poll_interval: Duration::from_millis(10),
            cleanup_grace: Duration::from_millis(30),
        };
        let coordinator = UploadCoordinator::new(backend.clone(), limits);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(coordinator.submit(file(10), tx).await.is_err());
        assert!(backend.polls.load(Ordering::SeqCst) > 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let settled = backend.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.polls.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn success_reports_message_and_client_progress() {
        let mut backend = FakeBackend::new(Duration::from_millis(5));
        backend.report_bytes = true;
        let coordinator = UploadCoordinator::new(Arc::new(backend), limits(1000, false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let message = coordinator.submit(file(10), tx).await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(UploadEvent::Started { .. })));
        assert!(events.contains(&UploadEvent::Progress(ProgressView {
            percent: 100,
            status: Some(QUEUED_STATUS.to_string()),
            server_side: false,
        })));
        assert!(events.contains(&UploadEvent::Succeeded(message)));
    }
}
