use facegate_core::locator::FaceDetect;
use facegate_core::recognizer::FaceEmbedder;
use facegate_core::{FaceGateError, FacePipeline, PipelineStats, Registration, VerifyOutcome};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] FaceGateError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        user: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Registration, FaceGateError>>,
    },
    Verify {
        user: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<VerifyOutcome, FaceGateError>>,
    },
    Status {
        user: String,
        reply: oneshot::Sender<bool>,
    },
    Delete {
        user: String,
        reply: oneshot::Sender<Result<bool, FaceGateError>>,
    },
    Info {
        reply: oneshot::Sender<PipelineStats>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        request: EngineRequest,
        reply_rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Request enrollment of `user` from an encoded image.
    pub async fn register(
        &self,
        user: String,
        image: Vec<u8>,
    ) -> Result<Registration, EngineError> {
        let (reply, rx) = oneshot::channel();
        Ok(self.call(EngineRequest::Register { user, image, reply }, rx).await??)
    }

    /// Request verification of `user` against an encoded image.
    pub async fn verify(&self, user: String, image: Vec<u8>) -> Result<VerifyOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        Ok(self.call(EngineRequest::Verify { user, image, reply }, rx).await??)
    }

    pub async fn user_status(&self, user: String) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.call(EngineRequest::Status { user, reply }, rx).await
    }

    pub async fn delete(&self, user: String) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        Ok(self.call(EngineRequest::Delete { user, reply }, rx).await??)
    }

    pub async fn info(&self) -> Result<PipelineStats, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.call(EngineRequest::Info { reply }, rx).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline and serves one request at a time, so store
/// mutations never interleave. Resources are loaded by the caller before
/// this point.
pub fn spawn_engine<D, E>(mut pipeline: FacePipeline<D, E>) -> Result<EngineHandle, EngineError>
where
    D: FaceDetect + Send + 'static,
    E: FaceEmbedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register { user, image, reply } => {
                        let _ = reply.send(pipeline.register(&user, &image));
                    }
                    EngineRequest::Verify { user, image, reply } => {
                        let _ = reply.send(pipeline.verify(&user, &image));
                    }
                    EngineRequest::Status { user, reply } => {
                        let _ = reply.send(pipeline.user_status(&user));
                    }
                    EngineRequest::Delete { user, reply } => {
                        let _ = reply.send(pipeline.delete(&user));
                    }
                    EngineRequest::Info { reply } => {
                        let _ = reply.send(pipeline.stats());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use facegate_core::recognizer::RecognizerError;
    use facegate_core::store::{EmbeddingStore, MemoryBackend};
    use facegate_core::{BoundingBox, Embedding, FaceTensor, PipelineConfig};
    use image::{GrayImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Treats any non-black pixel as part of the face.
    pub(crate) struct BrightRegion;

    impl FaceDetect for BrightRegion {
        fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
            let bright: Vec<(u32, u32)> = gray
                .enumerate_pixels()
                .filter(|(_, _, p)| p.0[0] > 0)
                .map(|(x, y, _)| (x, y))
                .collect();
            let x0 = bright.iter().map(|p| p.0).min();
            let y0 = bright.iter().map(|p| p.1).min();
            let (Some(x0), Some(y0)) = (x0, y0) else {
                return Vec::new();
            };
            let x1 = bright.iter().map(|p| p.0).max().unwrap_or(x0) + 1;
            let y1 = bright.iter().map(|p| p.1).max().unwrap_or(y0) + 1;
            vec![BoundingBox::new(x0, y0, x1 - x0, y1 - y0)]
        }
    }

    /// Embeds a face by the mean of each color channel, centred on mid-grey.
    pub(crate) struct ChannelMeans;

    impl FaceEmbedder for ChannelMeans {
        fn input_size(&self) -> usize {
            16
        }

        fn embed(&mut self, faces: &[FaceTensor]) -> Vec<Result<Embedding, RecognizerError>> {
            faces
                .iter()
                .map(|face| {
                    let v = face.view();
                    let n = (v.len() / 3) as f32;
                    let mut sums = [0.0f32; 3];
                    for ((_, _, c), &p) in v.indexed_iter() {
                        sums[c] += p;
                    }
                    let means = sums.iter().map(|s| s / n - 0.25).collect();
                    Embedding::from_raw(means).ok_or(RecognizerError::Degenerate)
                })
                .collect()
        }
    }

    pub(crate) fn test_pipeline() -> FacePipeline<BrightRegion, ChannelMeans> {
        let mut config = PipelineConfig::default();
        config.detection.equalize_histogram = false;
        config.model.input_size = 16;
        config.enrollment.augmentations = 1;
        FacePipeline::new(
            BrightRegion,
            ChannelMeans,
            EmbeddingStore::open(Box::new(MemoryBackend::new())),
            &config,
        )
    }

    /// A coloured square on black, PNG-encoded.
    pub(crate) fn face_png(color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            if (16..48).contains(&x) && (16..48).contains(&y) {
                Rgb(color)
            } else {
                Rgb([0, 0, 0])
            }
        });
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_engine_round_trip() {
        let engine = spawn_engine(test_pipeline()).unwrap();

        let reg = engine.register("alice".into(), face_png([200, 40, 40])).await.unwrap();
        assert_eq!(reg.embeddings_count, 1);
        assert!(engine.user_status("alice".into()).await.unwrap());
        assert_eq!(engine.info().await.unwrap().users, 1);

        let same = engine.verify("alice".into(), face_png([200, 40, 40])).await.unwrap();
        assert!(same.verified);

        let other = engine.verify("alice".into(), face_png([40, 40, 200])).await.unwrap();
        assert!(!other.verified);

        assert!(engine.delete("alice".into()).await.unwrap());
        assert!(!engine.user_status("alice".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_engine_surfaces_pipeline_errors() {
        let engine = spawn_engine(test_pipeline()).unwrap();
        let err = engine.verify("bob".into(), face_png([1, 2, 3])).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(FaceGateError::UserNotRegistered(_))));
    }
}
