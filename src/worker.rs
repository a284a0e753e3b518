use crate::{detector::Detector, error::Error, postprocess::Detections};
use anyhow::anyhow;
use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use tokio::sync::oneshot;
use tracing::{debug, info};

type DetectReply = Result<Detections, Error>;
type DetectRequest = (Bytes, oneshot::Sender<DetectReply>);

/// Owns the detector on a dedicated OS thread; the inference session is
/// driven synchronously, so it never blocks the async runtime.
pub struct DetectorWorker {
    receiver: Receiver<DetectRequest>,
    detector: Detector,
}

impl DetectorWorker {
    pub fn run(&mut self) {
        while let Ok((image_data, reply)) = self.receiver.recv() {
            let result = self.detector.detect(image_data);
            if reply.send(result).is_err() {
                debug!("Detection caller went away before the reply was sent");
            }
        }
        info!("Detector worker channel closed, shutting down");
    }
}

/// Cloneable handle request handlers use to run detections on the worker
/// thread.
#[derive(Clone)]
pub struct DetectorHandle {
    sender: Sender<DetectRequest>,
}

impl DetectorHandle {
    pub async fn detect(&self, image_data: Bytes) -> DetectReply {
        let (reply_sender, reply_receiver) = oneshot::channel();
        match self.sender.try_send((image_data, reply_sender)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(Error::Inference(anyhow!("detector queue is full")));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::Inference(anyhow!("detector worker is gone")));
            }
        }
        match reply_receiver.await {
            Ok(reply) => reply,
            Err(_) => Err(Error::Inference(anyhow!(
                "detector worker dropped the request"
            ))),
        }
    }
}

/// Spawn the worker thread over a bounded queue. The queue bound is the
/// overload-shedding limit across all connections.
pub fn spawn_detector_worker(
    detector: Detector,
    queue_size: usize,
) -> anyhow::Result<(DetectorHandle, std::thread::JoinHandle<()>)> {
    let (sender, receiver) = bounded(queue_size);
    let join_handle = std::thread::Builder::new()
        .name("detector-worker".into())
        .spawn(move || {
            let mut worker = DetectorWorker { receiver, detector };
            worker.run();
        })?;
    Ok((DetectorHandle { sender }, join_handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{InferenceEngine, RawModelOutput},
        postprocess::PostprocessConfig,
    };
    use ndarray::{Array2, Array4, ArrayD, IxDyn};

    struct EmptyEngine;

    impl InferenceEngine for EmptyEngine {
        fn infer(
            &mut self,
            _input: &Array4<f32>,
            _orig_size: &Array2<i64>,
        ) -> Result<RawModelOutput, Error> {
            Ok(RawModelOutput {
                labels: ArrayD::from_shape_vec(IxDyn(&[0]), vec![]).unwrap(),
                boxes: ArrayD::from_shape_vec(IxDyn(&[0, 4]), vec![]).unwrap(),
                scores: ArrayD::from_shape_vec(IxDyn(&[0]), vec![]).unwrap(),
            })
        }
    }

    fn png_bytes() -> Bytes {
        let rgb = image::RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(rgb)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        Bytes::from(buf.into_inner())
    }

    #[tokio::test]
    async fn round_trip_through_the_worker_thread() {
        let detector = Detector::with_engine(Box::new(EmptyEngine), PostprocessConfig::default());
        let (handle, _join) = spawn_detector_worker(detector, 4).unwrap();
        let detections = handle.detect(png_bytes()).await.unwrap();
        assert!(detections.is_empty());
    }

    #[tokio::test]
    async fn full_queue_sheds_load_instead_of_reporting_a_dead_worker() {
        let (sender, _receiver) = bounded(1);
        let handle = DetectorHandle { sender };
        let (occupant, _occupant_receiver) = oneshot::channel();
        handle.sender.try_send((png_bytes(), occupant)).unwrap();

        let err = handle.detect(png_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("queue is full"));
    }

    #[tokio::test]
    async fn dropped_worker_reports_disconnection() {
        let (sender, receiver) = bounded::<DetectRequest>(1);
        drop(receiver);
        let handle = DetectorHandle { sender };

        let err = handle.detect(png_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("worker is gone"));
    }

    #[tokio::test]
    async fn worker_errors_propagate_to_the_handle() {
        let detector = Detector::with_engine(Box::new(EmptyEngine), PostprocessConfig::default());
        let (handle, _join) = spawn_detector_worker(detector, 4).unwrap();
        let err = handle.detect(Bytes::from_static(&[1, 2, 3])).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
