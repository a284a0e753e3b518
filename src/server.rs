use crate::{
    error::Error,
    postprocess::Detections,
    proto::{
        Box as BoxMsg, DetectRequest, DetectResponse, Detection as DetectionMsg, Frame,
        FrameResult,
        vision_server::{Vision, VisionServer},
    },
    sink::FrameSink,
    worker::DetectorHandle,
};
use bytes::Bytes;
use futures::Stream;
use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming, transport::Server};
use tracing::{error, info, warn};

const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

pub struct VisionService {
    detector: DetectorHandle,
    sink: Arc<FrameSink>,
}

impl VisionService {
    pub fn new(detector: DetectorHandle, sink: FrameSink) -> Self {
        Self {
            detector,
            sink: Arc::new(sink),
        }
    }
}

fn validate_request(req: &DetectRequest) -> Result<(), Error> {
    if req.width == 0 || req.height == 0 {
        return Err(Error::InvalidArgument(
            "width and height must be nonzero".into(),
        ));
    }
    if req.data.is_empty() {
        return Err(Error::InvalidArgument("image data must not be empty".into()));
    }
    Ok(())
}

fn to_proto(detections: Detections) -> Vec<DetectionMsg> {
    detections
        .into_iter()
        .map(|d| DetectionMsg {
            r#box: Some(BoxMsg {
                x: d.bbox.x,
                y: d.bbox.y,
                w: d.bbox.w,
                h: d.bbox.h,
            }),
            class_id: d.class_id as i32,
            score: d.score,
        })
        .collect()
}

#[tonic::async_trait]
impl Vision for VisionService {
    async fn detect(
        &self,
        request: Request<DetectRequest>,
    ) -> Result<Response<DetectResponse>, Status> {
        let req = request.into_inner();
        validate_request(&req).map_err(|err| Status::invalid_argument(err.to_string()))?;

        let detections = self
            .detector
            .detect(Bytes::from(req.data))
            .await
            .map_err(|err| Status::internal(format!("inference failed: {err}")))?;

        Ok(Response::new(DetectResponse {
            detections: to_proto(detections),
        }))
    }

    type StreamDetectStream =
        Pin<Box<dyn Stream<Item = Result<FrameResult, Status>> + Send + 'static>>;

    async fn stream_detect(
        &self,
        request: Request<Streaming<Frame>>,
    ) -> Result<Response<Self::StreamDetectStream>, Status> {
        let mut inbound = request.into_inner();
        let detector = self.detector.clone();
        let sink = Arc::clone(&self.sink);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut frame_count = 0u64;
            loop {
                let frame = match inbound.message().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(status) => {
                        warn!(%status, frame_count, "Inbound frame stream failed");
                        break;
                    }
                };
                frame_count += 1;

                let result = process_frame(&detector, &sink, frame, frame_count).await;
                if tx.send(Ok(result)).await.is_err() {
                    // Caller hung up; stop reading further frames.
                    break;
                }
            }
            info!(frame_count, "Frame stream finished");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Run the sink and the detection pipeline for one frame, frames strictly in
/// arrival order. Pipeline failures degrade to an empty result; sink
/// failures are logged only. Neither ends the stream.
async fn process_frame(
    detector: &DetectorHandle,
    sink: &FrameSink,
    frame: Frame,
    frame_count: u64,
) -> FrameResult {
    let image_data = Bytes::from(frame.data.clone());
    let (saved, detected) = tokio::join!(sink.save(&frame), detector.detect(image_data));

    if let Err(err) = saved {
        warn!(
            frame_count,
            frame_index = frame.frame_index,
            %err,
            "Failed to persist frame"
        );
    }

    let detections = match detected {
        Ok(detections) => to_proto(detections),
        Err(err) => {
            error!(
                frame_count,
                frame_index = frame.frame_index,
                %err,
                "Inference failed, emitting empty result"
            );
            Vec::new()
        }
    };

    FrameResult {
        frame_index: frame.frame_index,
        timestamp_ns: frame.timestamp_ns,
        detections,
        stream_id: frame.stream_id,
    }
}

pub async fn run_server(
    port: u16,
    cancel_token: CancellationToken,
    service: VisionService,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "Vision server listening");
    Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(15)))
        .http2_keepalive_timeout(Some(Duration::from_secs(5)))
        .add_service(
            VisionServer::new(service)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .serve_with_shutdown(addr, cancel_token.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detector::Detector,
        engine::{InferenceEngine, RawModelOutput},
        postprocess::PostprocessConfig,
        proto::ImageFormat,
        sink::SinkConfig,
        worker::spawn_detector_worker,
    };
    use ndarray::{Array2, Array4, ArrayD, IxDyn};
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    struct CountingEngine {
        calls: Arc<AtomicUsize>,
    }

    impl InferenceEngine for CountingEngine {
        fn infer(
            &mut self,
            _input: &Array4<f32>,
            orig_size: &Array2<i64>,
        ) -> Result<RawModelOutput, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // One full-image corner-form box.
            let h = orig_size[[0, 0]] as f32;
            let w = orig_size[[0, 1]] as f32;
            Ok(RawModelOutput {
                labels: ArrayD::from_shape_vec(IxDyn(&[1]), vec![3.0]).unwrap(),
                boxes: ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![0.0, 0.0, w, h]).unwrap(),
                scores: ArrayD::from_shape_vec(IxDyn(&[1]), vec![0.9]).unwrap(),
            })
        }
    }

    fn service(calls: Arc<AtomicUsize>, root: &Path) -> VisionService {
        let detector = Detector::with_engine(
            Box::new(CountingEngine { calls }),
            PostprocessConfig::default(),
        );
        let (handle, _join) = spawn_detector_worker(detector, 4).unwrap();
        VisionService::new(
            handle,
            FrameSink::new(SinkConfig {
                root: root.to_path_buf(),
            }),
        )
    }

    fn png_bytes() -> Vec<u8> {
        let rgb = image::RgbImage::from_pixel(8, 6, image::Rgb([20, 20, 20]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(rgb)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn frame(frame_index: u64, data: Vec<u8>) -> Frame {
        Frame {
            stream_id: "s".to_string(),
            camera_id: "c".to_string(),
            frame_index,
            timestamp_ns: frame_index * 1_000,
            width: 8,
            height: 6,
            format: ImageFormat::Png as i32,
            data,
        }
    }

    #[tokio::test]
    async fn detect_rejects_zero_dimensions_without_invoking_the_engine() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dir = tempfile::tempdir().unwrap();
        let svc = service(calls.clone(), dir.path());

        let status = svc
            .detect(Request::new(DetectRequest {
                width: 0,
                height: 6,
                format: ImageFormat::Png as i32,
                data: png_bytes(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn detect_rejects_empty_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dir = tempfile::tempdir().unwrap();
        let svc = service(calls.clone(), dir.path());

        let status = svc
            .detect(Request::new(DetectRequest {
                width: 8,
                height: 6,
                format: ImageFormat::Png as i32,
                data: Vec::new(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn detect_returns_normalized_detections() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dir = tempfile::tempdir().unwrap();
        let svc = service(calls.clone(), dir.path());

        let response = svc
            .detect(Request::new(DetectRequest {
                width: 8,
                height: 6,
                format: ImageFormat::Png as i32,
                data: png_bytes(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.detections.len(), 1);
        let d = &response.detections[0];
        assert_eq!(d.class_id, 3);
        let b = d.r#box.as_ref().unwrap();
        assert!((b.x - 0.5).abs() < 1e-5 && (b.y - 0.5).abs() < 1e-5);
        assert!((b.w - 1.0).abs() < 1e-5 && (b.h - 1.0).abs() < 1e-5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupt_frame_degrades_without_ending_the_stream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dir = tempfile::tempdir().unwrap();
        let detector = Detector::with_engine(
            Box::new(CountingEngine {
                calls: calls.clone(),
            }),
            PostprocessConfig::default(),
        );
        let (handle, _join) = spawn_detector_worker(detector, 4).unwrap();
        let sink = FrameSink::new(SinkConfig {
            root: dir.path().to_path_buf(),
        });

        let bad = process_frame(&handle, &sink, frame(1, vec![0xff; 8]), 1).await;
        assert_eq!(bad.frame_index, 1);
        assert_eq!(bad.timestamp_ns, 1_000);
        assert!(bad.detections.is_empty());

        let good = process_frame(&handle, &sink, frame(2, png_bytes()), 2).await;
        assert_eq!(good.frame_index, 2);
        assert_eq!(good.detections.len(), 1);
        assert_eq!(good.stream_id, "s");

        // Both frames were persisted regardless of the pipeline outcome.
        let saved_dir = dir.path().join("s").join("c");
        assert!(saved_dir.join("img_1_1000.jpg").exists());
        assert!(saved_dir.join("img_2_2000.jpg").exists());
    }
}
