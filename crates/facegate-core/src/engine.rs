//! Async façade over the normalizer and recognizer.
//!
//! Detection and embedding are blocking and CPU-bound. Every such call is
//! boxed into a job, queued to a fixed pool of OS threads and awaited through
//! a oneshot reply, so the async scheduler is never blocked by inference.
//! Validity checks and cache access stay inline on the calling task.
//!
//! The normalizer and recognizer each own a single backend behind a mutex.
//! With several workers a detection and an embedding can overlap, but two
//! detections (or two embeddings) still take turns on their backend.

use crate::detector::FaceDetector;
use crate::embedder::Embedder;
use crate::error::FaceError;
use crate::normalizer::FaceImageNormalizer;
use crate::recognizer::FaceRecognizer;
use crate::types::{Descriptor, DescriptorId, Image, RawImage, RecognitionResult, Rectangle, CANONICAL_SIZE};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

/// Default number of worker threads.
pub const DEFAULT_WORKERS: usize = 2;

/// Queued jobs allowed per worker before `run` waits for room.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named OS threads pulling jobs from one shared queue.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> Result<Self, FaceError> {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Job>(size * QUEUE_DEPTH_PER_WORKER);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let rx = Arc::clone(&rx);
            let handle = std::thread::Builder::new()
                .name(format!("facegate-worker-{index}"))
                .spawn(move || worker_loop(index, &rx))
                .map_err(FaceError::WorkerSpawn)?;
            workers.push(handle);
        }
        tracing::info!(workers = size, "engine worker pool started");

        Ok(Self { tx: Some(tx), workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run `f` on a worker and await its value.
    ///
    /// If the returned future is dropped, `f` still runs to completion and
    /// its value is discarded.
    pub async fn run<T, F>(&self, f: F) -> Result<T, FaceError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(FaceError::EngineStopped)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            if reply_tx.send(f()).is_err() {
                tracing::debug!("caller went away; job result discarded");
            }
        });
        tx.send(job).await.map_err(|_| FaceError::EngineStopped)?;
        reply_rx.await.map_err(|_| FaceError::EngineStopped)
    }
}

fn worker_loop(index: usize, rx: &Mutex<mpsc::Receiver<Job>>) {
    tracing::debug!(worker = index, "engine worker started");
    loop {
        let job = {
            let mut rx = rx.lock().unwrap_or_else(|e| e.into_inner());
            rx.blocking_recv()
        };
        let Some(job) = job else { break };
        // A panicking job drops its reply sender; the caller sees EngineStopped.
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(worker = index, "engine job panicked");
        }
    }
    tracing::debug!(worker = index, "engine worker exiting");
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets every worker finish its current job and exit.
        self.tx.take();
        let current = std::thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("engine worker panicked during shutdown");
            }
        }
    }
}

/// Normalizer, recognizer and worker pool behind one async API.
///
/// Extra workers pipeline requests across the two backends; they do not add
/// parallel inference on the same backend.
pub struct FaceEngine<D, E> {
    normalizer: Arc<FaceImageNormalizer<D>>,
    recognizer: Arc<FaceRecognizer<E>>,
    pool: WorkerPool,
}

impl<D, E> FaceEngine<D, E>
where
    D: FaceDetector + 'static,
    E: Embedder + 'static,
{
    pub fn new(
        normalizer: FaceImageNormalizer<D>,
        recognizer: FaceRecognizer<E>,
        workers: usize,
    ) -> Result<Self, FaceError> {
        Ok(Self {
            normalizer: Arc::new(normalizer),
            recognizer: Arc::new(recognizer),
            pool: WorkerPool::new(workers)?,
        })
    }

    pub fn normalizer(&self) -> &FaceImageNormalizer<D> {
        &self.normalizer
    }

    pub fn recognizer(&self) -> &FaceRecognizer<E> {
        &self.recognizer
    }

    pub fn workers(&self) -> usize {
        self.pool.size()
    }

    pub fn check_image_valid(&self, image: &RawImage) -> bool {
        self.normalizer.check_image_valid(image)
    }

    pub fn check_image_normalized(&self, image: &RawImage) -> bool {
        self.recognizer.check_image_normalized(image)
    }

    pub fn check_descriptor_valid(&self, descriptor: &Descriptor) -> bool {
        self.recognizer.check_descriptor_valid(descriptor)
    }

    /// Detector output for a raw image, unfiltered.
    pub async fn find_faces(&self, image: RawImage) -> Result<Vec<Rectangle>, FaceError> {
        let image = validated(image)?;
        let normalizer = Arc::clone(&self.normalizer);
        self.pool.run(move || normalizer.find_faces(&image)).await?
    }

    /// Canonical crop of the largest face, or `None` when there is no face.
    pub async fn normalize(&self, image: RawImage) -> Result<Option<Image>, FaceError> {
        let image = validated(image)?;
        let normalizer = Arc::clone(&self.normalizer);
        self.pool.run(move || normalizer.normalize(&image)).await?
    }

    /// Embed an already normalized crop.
    pub async fn calculate_descriptor(&self, face: RawImage) -> Result<Descriptor, FaceError> {
        let face = normalized(face)?;
        let recognizer = Arc::clone(&self.recognizer);
        self.pool.run(move || recognizer.calculate_descriptor(&face)).await?
    }

    /// Enrollment flow: normalize a raw image and embed its face.
    ///
    /// Unlike [`normalize`](Self::normalize), an image without a face is an
    /// error here: there is nothing to enroll.
    pub async fn descriptor_from_image(&self, image: RawImage) -> Result<Descriptor, FaceError> {
        let image = validated(image)?;
        let normalizer = Arc::clone(&self.normalizer);
        let recognizer = Arc::clone(&self.recognizer);
        self.pool
            .run(move || {
                let face = normalizer.normalize(&image)?.ok_or(FaceError::NoFaceFound)?;
                recognizer.calculate_descriptor(&face)
            })
            .await?
    }

    /// Match an already normalized crop against the enrolled descriptors.
    pub async fn recognize(&self, face: RawImage) -> Result<RecognitionResult, FaceError> {
        let face = normalized(face)?;
        let recognizer = Arc::clone(&self.recognizer);
        self.pool.run(move || recognizer.recognize(&face)).await?
    }

    /// Full pipeline on a raw image. `Ok(None)` means no face was found.
    pub async fn identify(&self, image: RawImage) -> Result<Option<RecognitionResult>, FaceError> {
        let image = validated(image)?;
        let normalizer = Arc::clone(&self.normalizer);
        let recognizer = Arc::clone(&self.recognizer);
        self.pool
            .run(move || match normalizer.normalize(&image)? {
                Some(face) => recognizer.recognize(&face).map(Some),
                None => Ok(None),
            })
            .await?
    }

    /// Inline: a cache lookup is O(N·D) and does not block.
    pub fn recognize_by_descriptor(&self, descriptor: &Descriptor) -> Result<RecognitionResult, FaceError> {
        self.recognizer.recognize_by_descriptor(descriptor)
    }

    /// Replace the enrolled set. See [`FaceRecognizer::update_descriptors`].
    pub fn update_descriptors(
        &self,
        pairs: impl IntoIterator<Item = (DescriptorId, Descriptor)>,
    ) -> Result<usize, FaceError> {
        self.recognizer.update_descriptors(pairs)
    }
}

fn validated(raw: RawImage) -> Result<Image, FaceError> {
    Image::try_from(raw).map_err(FaceError::InvalidImage)
}

fn normalized(raw: RawImage) -> Result<Image, FaceError> {
    let image = validated(raw)?;
    if image.width() != CANONICAL_SIZE || image.height() != CANONICAL_SIZE {
        return Err(FaceError::InvalidImage(format!(
            "expected a {CANONICAL_SIZE}x{CANONICAL_SIZE} face crop, got {}x{}",
            image.width(),
            image.height()
        )));
    }
    Ok(image)
}
