//! Sequential execution of expanded tasks against the remote service.
//!
//! One run is active at a time and tasks go out strictly one after another;
//! requesting a second run while one is active cancels the active run
//! instead. Failures never abort the run: a task retries only while it is
//! free under the account subscription (or explicitly marked retry-all), up
//! to five times, and is otherwise skipped. Cancellation is cooperative:
//! checked before each task and after each response, never mid-sleep.
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::AppResult;
use crate::novelai::client::{NovelAiClient, SubscriptionInfo};
use crate::output;
use crate::template::cost::estimate_cost;
use crate::template::expansion::{expand, GenerationTask};
use crate::template::GenerationTemplate;

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(3000);
const LONG_RETRY_DELAY: Duration = Duration::from_millis(5000);
const STATUS_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Expanding = 1,
    Running = 2,
    Completed = 3,
    Cancelled = 4,
    Faulted = 5,
}

impl RunState {
    fn from_u8(raw: u8) -> RunState {
        match raw {
            1 => RunState::Expanding,
            2 => RunState::Running,
            3 => RunState::Completed,
            4 => RunState::Cancelled,
            5 => RunState::Faulted,
            _ => RunState::Idle,
        }
    }
}

/// The submission seam between the engine and the remote service.
#[async_trait]
pub trait ImageBackend {
    async fn generate(&self, task: &GenerationTask) -> AppResult<Vec<u8>>;
}

#[async_trait]
impl ImageBackend for NovelAiClient {
    async fn generate(&self, task: &GenerationTask) -> AppResult<Vec<u8>> {
        self.generate_image(task).await
    }
}

/// Per-run outcome summary.
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub files: Vec<PathBuf>,
}

pub struct Runner<B> {
    backend: B,
    subscription: SubscriptionInfo,
    cancel: Arc<AtomicBool>,
    active: AtomicBool,
    state: AtomicU8,
}

impl<B: ImageBackend> Runner<B> {
    pub fn new(backend: B, subscription: SubscriptionInfo) -> Self {
        Runner {
            backend,
            subscription,
            cancel: Arc::new(AtomicBool::new(false)),
            active: AtomicBool::new(false),
            state: AtomicU8::new(RunState::Idle as u8),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Shared flag a signal handler can flip to stop the run after the
    /// in-flight task settles.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Expand a template and run every resulting task.
    pub async fn execute<R: Rng>(
        &self,
        template: &GenerationTemplate,
        rng: &mut R,
    ) -> AppResult<RunReport> {
        self.set_state(RunState::Expanding);
        let tasks = match expand(template, rng) {
            Ok(tasks) => tasks,
            Err(e) => {
                self.set_state(RunState::Faulted);
                self.set_state(RunState::Idle);
                return Err(e);
            }
        };
        Ok(self.run(&tasks).await)
    }

    /// Drive the full task list. Invoked while a run is already active, this
    /// requests cancellation of that run and returns without starting a new
    /// one.
    pub async fn run(&self, tasks: &[GenerationTask]) -> RunReport {
        if self.active.swap(true, Ordering::SeqCst) {
            self.request_cancel();
            return RunReport {
                cancelled: true,
                ..Default::default()
            };
        }
        self.cancel.store(false, Ordering::SeqCst);
        self.set_state(RunState::Running);

        let mut report = RunReport::default();
        let mut retries = 0u32;
        let mut index = 0usize;
        while index < tasks.len() {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            let task = &tasks[index];
            match self.backend.generate(task).await {
                Ok(archive) => {
                    match self.save_archive(task, &archive) {
                        Ok(mut files) => {
                            report.completed += 1;
                            report.files.append(&mut files);
                        }
                        Err(e) => {
                            // Disk trouble is logged, never fatal to the run.
                            tracing::error!("Failed to write output for task {}: {}", index, e);
                            report.failed += 1;
                        }
                    }
                    retries = 0;
                    index += 1;
                }
                Err(e) => {
                    tracing::error!("Task {} failed: {}", index, e);
                    let rate_limited = e.status() == Some(STATUS_TOO_MANY_REQUESTS);
                    let cost =
                        estimate_cost(&task.template, self.subscription.tier, self.subscription.active);
                    if !self.cancelled()
                        && retries < MAX_RETRIES
                        && (cost == 0 || task.template.retry_all)
                    {
                        retries += 1;
                        tracing::info!("Retrying task {} (attempt {})", index, retries + 1);
                        tokio::time::sleep(retry_delay(retries, rate_limited)).await;
                        continue;
                    }
                    report.failed += 1;
                    retries = 0;
                    index += 1;
                }
            }
        }

        self.set_state(if report.cancelled {
            RunState::Cancelled
        } else {
            RunState::Completed
        });
        tracing::info!(
            "Run finished: {} completed, {} failed, cancelled: {}",
            report.completed,
            report.failed,
            report.cancelled
        );
        self.set_state(RunState::Idle);
        self.active.store(false, Ordering::SeqCst);
        report
    }

    /// Unpack the response archive into resolved output paths.
    fn save_archive(&self, task: &GenerationTask, archive: &[u8]) -> AppResult<Vec<PathBuf>> {
        let t = &task.template;
        let placeholders = output::placeholder_map(
            t.seed.unwrap_or_default(),
            &t.prompt,
            &task.current_replace,
        );

        let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
        let mut written = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            let extension = Path::new(entry.name())
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png")
                .to_string();
            let path = output::resolve_output_path(
                &t.output_path,
                &t.output_filename,
                &placeholders,
                &extension,
            )?;
            std::fs::write(&path, &bytes)?;
            tracing::info!("Saved {} ({} bytes)", path.display(), bytes.len());
            if t.save_jpeg {
                match save_jpeg_sibling(&path, &bytes) {
                    Ok(sibling) => written.push(sibling),
                    Err(e) => tracing::warn!("JPEG re-encode failed for {}: {}", path.display(), e),
                }
            }
            written.push(path);
        }
        Ok(written)
    }
}

/// Sleep between attempts: longer once the task keeps failing or the service
/// says it is rate-limited.
fn retry_delay(retries: u32, rate_limited: bool) -> Duration {
    if retries >= 3 || rate_limited {
        LONG_RETRY_DELAY
    } else {
        RETRY_DELAY
    }
}

fn save_jpeg_sibling(image_path: &Path, bytes: &[u8]) -> AppResult<PathBuf> {
    let img = image::load_from_memory(bytes)?;
    let dir = image_path.parent().unwrap_or(Path::new("."));
    let stem = image_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let jpeg_path = output::disambiguate(dir, stem, "jpg");
    let mut out = Cursor::new(Vec::new());
    // JPEG has no alpha; flatten before encoding.
    image::DynamicImage::from(img.to_rgb8()).write_to(&mut out, image::ImageFormat::Jpeg)?;
    std::fs::write(&jpeg_path, out.into_inner())?;
    Ok(jpeg_path)
}
