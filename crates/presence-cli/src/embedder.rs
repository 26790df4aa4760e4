//! Client for the external face-embedding helper.
//!
//! The helper is a long-running child process that owns the detection and
//! embedding models. Each request is one JSON header line followed by the
//! raw pixel bytes on stdin; each response is one JSON line on stdout.

use presence_core::liveness::EyeContour;
use presence_core::{EmbedError, Embedding, EyeLandmarks, EyeLocator, FaceEmbedder, Frame};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HelperOp {
    Embed,
    Eyes,
}

#[derive(Debug, Serialize)]
struct RequestHeader<'a> {
    op: HelperOp,
    width: u32,
    height: u32,
    format: &'a str,
    len: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EyesPayload {
    pub left: [[f32; 2]; 6],
    pub right: [[f32; 2]; 6],
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HelperResponse {
    Ok {
        #[serde(default)]
        embedding: Option<Vec<f32>>,
        #[serde(default)]
        eyes: Option<EyesPayload>,
        #[serde(default)]
        model: Option<String>,
    },
    NoFace,
    Error {
        message: String,
    },
}

/// Serialize one request: header line, then the frame bytes.
pub fn encode_request(op: HelperOp, frame: &Frame) -> Result<Vec<u8>, EmbedError> {
    let header = RequestHeader {
        op,
        width: frame.width,
        height: frame.height,
        format: frame.format.as_str(),
        len: frame.data.len(),
    };
    let mut buf = serde_json::to_vec(&header)
        .map_err(|e| EmbedError::Protocol(format!("failed to encode request: {e}")))?;
    buf.push(b'\n');
    buf.extend_from_slice(&frame.data);
    Ok(buf)
}

pub fn parse_response(line: &str) -> Result<HelperResponse, EmbedError> {
    serde_json::from_str(line.trim())
        .map_err(|e| EmbedError::Protocol(format!("failed to parse helper response: {e}")))
}

/// Interpret an `embed` response.
pub fn embedding_from(response: HelperResponse) -> Result<Option<Embedding>, EmbedError> {
    match response {
        HelperResponse::Ok {
            embedding: Some(values),
            model,
            ..
        } => {
            if values.is_empty() {
                return Err(EmbedError::Protocol("helper returned an empty embedding".into()));
            }
            Ok(Some(Embedding {
                values,
                model_version: model,
            }))
        }
        HelperResponse::Ok { embedding: None, .. } => Err(EmbedError::Protocol(
            "helper response is missing 'embedding'".into(),
        )),
        HelperResponse::NoFace => Ok(None),
        HelperResponse::Error { message } => Err(EmbedError::Failed(message)),
    }
}

/// Interpret an `eyes` response.
pub fn eyes_from(response: HelperResponse) -> Result<Option<EyeLandmarks>, EmbedError> {
    fn contour(points: [[f32; 2]; 6]) -> EyeContour {
        points.map(|[x, y]| (x, y))
    }

    match response {
        HelperResponse::Ok {
            eyes: Some(eyes), ..
        } => Ok(Some(EyeLandmarks {
            left: contour(eyes.left),
            right: contour(eyes.right),
        })),
        HelperResponse::Ok { eyes: None, .. } => {
            Err(EmbedError::Protocol("helper response is missing 'eyes'".into()))
        }
        HelperResponse::NoFace => Ok(None),
        HelperResponse::Error { message } => Err(EmbedError::Failed(message)),
    }
}

struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl HelperProcess {
    /// Pipe failures mean the helper is gone; a bad reply only fails this request.
    fn round_trip(&mut self, op: HelperOp, frame: &Frame) -> Result<HelperResponse, EmbedError> {
        let request = encode_request(op, frame)?;
        self.stdin
            .write_all(&request)
            .and_then(|()| self.stdin.flush())
            .map_err(|e| EmbedError::Disconnected(format!("failed to write to helper: {e}")))?;

        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .map_err(|e| EmbedError::Disconnected(format!("failed to read from helper: {e}")))?;
        if read == 0 {
            return Err(EmbedError::Disconnected("helper closed its output".into()));
        }
        parse_response(&line)
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Handle to a running helper. Clones share the same process, so one helper
/// serves both the session's embedder and the blink gate's eye locator.
#[derive(Clone)]
pub struct HelperEmbedder {
    process: Arc<Mutex<HelperProcess>>,
}

impl HelperEmbedder {
    /// Start `command[0]` with the remaining elements as arguments.
    pub fn spawn(command: &[String]) -> Result<Self, EmbedError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EmbedError::Unavailable("empty helper command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EmbedError::Unavailable(format!("failed to start {program}: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(EmbedError::Unavailable("helper pipes unavailable".into()));
        };

        tracing::info!(program = %program, pid = child.id(), "embedding helper started");
        Ok(Self {
            process: Arc::new(Mutex::new(HelperProcess {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            })),
        })
    }

    fn request(&self, op: HelperOp, frame: &Frame) -> Result<HelperResponse, EmbedError> {
        let mut process = self.process.lock().unwrap_or_else(|e| e.into_inner());
        process.round_trip(op, frame)
    }
}

impl FaceEmbedder for HelperEmbedder {
    fn embed(&mut self, frame: &Frame) -> Result<Option<Embedding>, EmbedError> {
        embedding_from(self.request(HelperOp::Embed, frame)?)
    }
}

impl EyeLocator for HelperEmbedder {
    fn locate(&mut self, frame: &Frame) -> Result<Option<EyeLandmarks>, EmbedError> {
        eyes_from(self.request(HelperOp::Eyes, frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::PixelFormat;

    #[test]
    fn test_encode_request_header_then_bytes() {
        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Rgb8, 0).unwrap();
        let buf = encode_request(HelperOp::Embed, &frame).unwrap();

        let newline = buf.iter().position(|&b| b == b'\n').unwrap();
        let header: serde_json::Value = serde_json::from_slice(&buf[..newline]).unwrap();
        assert_eq!(
            header,
            serde_json::json!({"op": "embed", "width": 2, "height": 1, "format": "rgb8", "len": 6})
        );
        assert_eq!(&buf[newline + 1..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_parse_embedding_response() {
        let resp = parse_response(r#"{"status":"ok","embedding":[0.5,-1.0],"model":"Facenet"}"#).unwrap();
        let embedding = embedding_from(resp).unwrap().unwrap();
        assert_eq!(embedding.values, vec![0.5, -1.0]);
        assert_eq!(embedding.model_version.as_deref(), Some("Facenet"));
    }

    #[test]
    fn test_parse_no_face_and_error() {
        assert_eq!(embedding_from(parse_response(r#"{"status":"no_face"}"#).unwrap()).unwrap(), None);

        let err = embedding_from(
            parse_response(r#"{"status":"error","message":"model not loaded"}"#).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, EmbedError::Failed(ref m) if m == "model not loaded"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_malformed_responses_are_protocol_errors() {
        assert!(matches!(parse_response("not json"), Err(EmbedError::Protocol(_))));
        assert!(matches!(
            parse_response(r#"{"status":"maybe"}"#),
            Err(EmbedError::Protocol(_))
        ));
        assert!(matches!(
            embedding_from(parse_response(r#"{"status":"ok"}"#).unwrap()),
            Err(EmbedError::Protocol(_))
        ));
        assert!(matches!(
            embedding_from(parse_response(r#"{"status":"ok","embedding":[]}"#).unwrap()),
            Err(EmbedError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_eyes_response() {
        let line = r#"{"status":"ok","eyes":{
            "left":[[0,0],[1,-1],[2,-1],[3,0],[2,1],[1,1]],
            "right":[[5,0],[6,-1],[7,-1],[8,0],[7,1],[6,1]]}}"#;
        let eyes = eyes_from(parse_response(line).unwrap()).unwrap().unwrap();
        assert_eq!(eyes.left[1], (1.0, -1.0));
        assert_eq!(eyes.right[3], (8.0, 0.0));
        assert!(eyes_from(parse_response(r#"{"status":"no_face"}"#).unwrap())
            .unwrap()
            .is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_process_round_trip() {
        // Reads the header line, discards the 4 pixel bytes, answers once.
        let script = r#"read header; head -c 4 > /dev/null; echo '{"status":"ok","embedding":[1.0,2.0]}'"#;
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let mut helper = HelperEmbedder::spawn(&command).unwrap();

        let frame = Frame::gray(vec![9; 4], 2, 2).unwrap();
        let embedding = helper.embed(&frame).unwrap().unwrap();
        assert_eq!(embedding.values, vec![1.0, 2.0]);

        // The helper has exited; the next request reports it as gone.
        let err = helper.embed(&frame).unwrap_err();
        assert!(matches!(err, EmbedError::Disconnected(_)));
        assert!(err.is_fatal());
        assert!(matches!(helper.locate(&frame), Err(EmbedError::Disconnected(_))));
    }

    #[test]
    fn test_spawn_missing_program() {
        let command = vec!["/nonexistent/presence-helper".to_string()];
        assert!(matches!(
            HelperEmbedder::spawn(&command),
            Err(EmbedError::Unavailable(_))
        ));
    }
}
