// ============================================================================
// WORKER - message-passing offload for pixel-heavy mask jobs
// ============================================================================
//
// Requests own the mask they operate on.  The sender gives the buffer up when
// it submits and gets it back inside the response (success or error), so the
// mask only ever has one writer.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::mpsc;

use crate::canvas::{DirtyRect, MaskBuffer};
use crate::components::brush::{self, BrushMode, Point};
use crate::error::WorkerError;
use crate::log_err;
use crate::ops::tiles::{self, Tile};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    ApplyStamp,
    ApplyStrokePath,
    ExtractTiles,
    ValidateBinary,
    EnforceBinary,
    /// Only ever used on responses.
    Error,
}

impl JobKind {
    pub fn tag(self) -> &'static str {
        match self {
            JobKind::ApplyStamp => "APPLY_STAMP",
            JobKind::ApplyStrokePath => "APPLY_STROKE_PATH",
            JobKind::ExtractTiles => "EXTRACT_TILES",
            JobKind::ValidateBinary => "VALIDATE_BINARY",
            JobKind::EnforceBinary => "ENFORCE_BINARY",
            JobKind::Error => "ERROR",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, WorkerError> {
        match tag {
            "APPLY_STAMP" => Ok(JobKind::ApplyStamp),
            "APPLY_STROKE_PATH" => Ok(JobKind::ApplyStrokePath),
            "EXTRACT_TILES" => Ok(JobKind::ExtractTiles),
            "VALIDATE_BINARY" => Ok(JobKind::ValidateBinary),
            "ENFORCE_BINARY" => Ok(JobKind::EnforceBinary),
            "ERROR" => Ok(JobKind::Error),
            other => Err(WorkerError::UnknownMessageType(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobPayload {
    ApplyStamp {
        mask: MaskBuffer,
        x: f32,
        y: f32,
        size: f32,
        mode: BrushMode,
    },
    ApplyStrokePath {
        mask: MaskBuffer,
        points: Vec<Point>,
        size: f32,
        mode: BrushMode,
        spacing: f32,
    },
    ExtractTiles {
        mask: MaskBuffer,
        tile_size: u32,
    },
    ValidateBinary {
        mask: MaskBuffer,
    },
    EnforceBinary {
        mask: MaskBuffer,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::ApplyStamp { .. } => JobKind::ApplyStamp,
            JobPayload::ApplyStrokePath { .. } => JobKind::ApplyStrokePath,
            JobPayload::ExtractTiles { .. } => JobKind::ExtractTiles,
            JobPayload::ValidateBinary { .. } => JobKind::ValidateBinary,
            JobPayload::EnforceBinary { .. } => JobKind::EnforceBinary,
        }
    }

    pub fn mask(&self) -> &MaskBuffer {
        match self {
            JobPayload::ApplyStamp { mask, .. }
            | JobPayload::ApplyStrokePath { mask, .. }
            | JobPayload::ExtractTiles { mask, .. }
            | JobPayload::ValidateBinary { mask }
            | JobPayload::EnforceBinary { mask } => mask,
        }
    }

    pub fn into_mask(self) -> MaskBuffer {
        match self {
            JobPayload::ApplyStamp { mask, .. }
            | JobPayload::ApplyStrokePath { mask, .. }
            | JobPayload::ExtractTiles { mask, .. }
            | JobPayload::ValidateBinary { mask }
            | JobPayload::EnforceBinary { mask } => mask,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub kind: JobKind,
    pub payload: JobPayload,
}

impl WorkerRequest {
    pub fn new(id: u64, payload: JobPayload) -> Self {
        Self {
            id,
            kind: payload.kind(),
            payload,
        }
    }

    /// Build a request from a wire type tag.  The tag must name the job the
    /// payload carries.
    pub fn from_tag(id: u64, tag: &str, payload: JobPayload) -> Result<Self, WorkerError> {
        let kind = JobKind::from_tag(tag)?;
        if kind != payload.kind() {
            return Err(WorkerError::PayloadMismatch {
                expected: kind,
                found: payload.kind(),
            });
        }
        Ok(Self { id, kind, payload })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobResult {
    Stamped {
        mask: MaskBuffer,
        changed: bool,
        dirty: DirtyRect,
    },
    Tiles {
        mask: MaskBuffer,
        tile_size: u32,
        tiles: Vec<Tile>,
    },
    Validated {
        mask: MaskBuffer,
        valid: bool,
        non_binary: usize,
    },
    Enforced {
        mask: MaskBuffer,
        repaired: usize,
    },
}

impl JobResult {
    pub fn mask(&self) -> &MaskBuffer {
        match self {
            JobResult::Stamped { mask, .. }
            | JobResult::Tiles { mask, .. }
            | JobResult::Validated { mask, .. }
            | JobResult::Enforced { mask, .. } => mask,
        }
    }

    pub fn into_mask(self) -> MaskBuffer {
        match self {
            JobResult::Stamped { mask, .. }
            | JobResult::Tiles { mask, .. }
            | JobResult::Validated { mask, .. }
            | JobResult::Enforced { mask, .. } => mask,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkerResponse {
    Done {
        id: u64,
        kind: JobKind,
        result: JobResult,
    },
    /// The buffer comes back whenever the request still owned one, so the
    /// caller can rerun the job synchronously.
    Error {
        id: u64,
        error: WorkerError,
        mask: Option<MaskBuffer>,
    },
}

impl WorkerResponse {
    pub fn id(&self) -> u64 {
        match self {
            WorkerResponse::Done { id, .. } | WorkerResponse::Error { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            WorkerResponse::Done { kind, .. } => *kind,
            WorkerResponse::Error { .. } => JobKind::Error,
        }
    }

    pub fn into_result(self) -> Result<JobResult, WorkerError> {
        match self {
            WorkerResponse::Done { result, .. } => Ok(result),
            WorkerResponse::Error { error, .. } => Err(error),
        }
    }
}

/// Run one job to completion on the calling thread.  This is both the worker
/// body and the synchronous fallback.
pub fn execute(request: WorkerRequest) -> WorkerResponse {
    let WorkerRequest { id, kind, payload } = request;

    if kind != payload.kind() {
        let error = if kind == JobKind::Error {
            WorkerError::UnknownMessageType(kind.tag().to_string())
        } else {
            WorkerError::PayloadMismatch {
                expected: kind,
                found: payload.kind(),
            }
        };
        return WorkerResponse::Error {
            id,
            error,
            mask: Some(payload.into_mask()),
        };
    }
    if let Err(error) = payload.mask().check_len() {
        return WorkerResponse::Error {
            id,
            error,
            mask: Some(payload.into_mask()),
        };
    }

    let result = match payload {
        JobPayload::ApplyStamp {
            mut mask,
            x,
            y,
            size,
            mode,
        } => {
            let (w, h) = (mask.width, mask.height);
            let r = brush::apply_stamp(&mut mask.data, w, h, x, y, size, mode);
            JobResult::Stamped {
                mask,
                changed: r.changed,
                dirty: r.dirty,
            }
        }
        JobPayload::ApplyStrokePath {
            mut mask,
            points,
            size,
            mode,
            spacing,
        } => {
            let (w, h) = (mask.width, mask.height);
            let r = brush::apply_stroke_path(&mut mask.data, w, h, &points, size, mode, spacing);
            JobResult::Stamped {
                mask,
                changed: r.changed,
                dirty: r.dirty,
            }
        }
        JobPayload::ExtractTiles { mask, tile_size } => {
            let tile_size = tile_size.max(1);
            let tiles = tiles::extract_tiles(&mask, tile_size);
            JobResult::Tiles { mask, tile_size, tiles }
        }
        JobPayload::ValidateBinary { mask } => {
            let non_binary = brush::count_non_binary(&mask.data);
            JobResult::Validated {
                mask,
                valid: non_binary == 0,
                non_binary,
            }
        }
        JobPayload::EnforceBinary { mut mask } => {
            let repaired = brush::enforce_binary(&mut mask.data);
            JobResult::Enforced { mask, repaired }
        }
    };
    WorkerResponse::Done { id, kind, result }
}

// ============================================================================
// Wire encoding for out-of-process execution contexts
// ============================================================================

pub fn encode_request(request: &WorkerRequest) -> Result<Vec<u8>, WorkerError> {
    Ok(bincode::serialize(request)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<WorkerRequest, WorkerError> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn encode_response(response: &WorkerResponse) -> Result<Vec<u8>, WorkerError> {
    Ok(bincode::serialize(response)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<WorkerResponse, WorkerError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Serve one encoded request.  A request that cannot be decoded is answered
/// with an error envelope for id 0.
pub fn handle_encoded(bytes: &[u8]) -> Result<Vec<u8>, WorkerError> {
    let response = match decode_request(bytes) {
        Ok(request) => execute(request),
        Err(error) => WorkerResponse::Error {
            id: 0,
            error,
            mask: None,
        },
    };
    encode_response(&response)
}

// ============================================================================
// MaskWorker - background execution on the rayon pool
// ============================================================================

/// Submits jobs to the rayon pool and collects responses over a channel.
/// Responses to abandoned requests are dropped on receipt.
pub struct MaskWorker {
    sender: mpsc::Sender<WorkerResponse>,
    receiver: mpsc::Receiver<WorkerResponse>,
    next_id: u64,
    in_flight: HashSet<u64>,
    abandoned: HashSet<u64>,
    /// Responses received by `wait` while looking for another id.
    ready: VecDeque<WorkerResponse>,
}

impl Default for MaskWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl MaskWorker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            next_id: 1,
            in_flight: HashSet::new(),
            abandoned: HashSet::new(),
            ready: VecDeque::new(),
        }
    }

    /// Hand a job (and the mask inside it) to the pool.  Returns the id its
    /// response will carry.
    pub fn submit(&mut self, payload: JobPayload) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.submit_request(WorkerRequest::new(id, payload));
        id
    }

    pub fn submit_request(&mut self, request: WorkerRequest) {
        let id = request.id;
        self.in_flight.insert(id);
        let sender = self.sender.clone();
        rayon::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| execute(request)));
            let response = match result {
                Ok(response) => response,
                Err(panic_info) => {
                    let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    log_err!("Worker job {} panicked: {}", id, msg);
                    WorkerResponse::Error {
                        id,
                        error: WorkerError::Panicked(msg),
                        mask: None,
                    }
                }
            };
            let _ = sender.send(response);
        });
    }

    /// Ignore the eventual response for `id`.
    pub fn abandon(&mut self, id: u64) -> bool {
        if self.in_flight.remove(&id) {
            self.abandoned.insert(id);
            true
        } else {
            false
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.in_flight.contains(&id)
    }

    /// Accept a received response unless its request was abandoned.
    fn admit(&mut self, response: WorkerResponse) -> Option<WorkerResponse> {
        let id = response.id();
        if self.abandoned.remove(&id) {
            return None;
        }
        self.in_flight.remove(&id);
        Some(response)
    }

    /// Drain every response that has arrived, without blocking.
    pub fn poll(&mut self) -> Vec<WorkerResponse> {
        let mut out: Vec<WorkerResponse> = self.ready.drain(..).collect();
        while let Ok(response) = self.receiver.try_recv() {
            if let Some(response) = self.admit(response) {
                out.push(response);
            }
        }
        out
    }

    /// Block until the response for `id` arrives.  Other responses received
    /// meanwhile are kept for the next `poll`.  Ids that are unknown or
    /// abandoned report `Disconnected`.
    pub fn wait(&mut self, id: u64) -> Result<WorkerResponse, WorkerError> {
        if let Some(pos) = self.ready.iter().position(|r| r.id() == id)
            && let Some(response) = self.ready.remove(pos)
        {
            return Ok(response);
        }
        if !self.in_flight.contains(&id) {
            return Err(WorkerError::Disconnected);
        }
        loop {
            let response = self.receiver.recv().map_err(|_| WorkerError::Disconnected)?;
            let Some(response) = self.admit(response) else {
                continue;
            };
            if response.id() == id {
                return Ok(response);
            }
            self.ready.push_back(response);
        }
    }

    /// Block until every non-abandoned job has answered.
    pub fn wait_all(&mut self) -> Vec<WorkerResponse> {
        let mut out: Vec<WorkerResponse> = self.ready.drain(..).collect();
        while !self.in_flight.is_empty() {
            match self.receiver.recv() {
                Ok(response) => {
                    if let Some(response) = self.admit(response) {
                        out.push(response);
                    }
                }
                Err(_) => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn painted(width: u32, height: u32) -> MaskBuffer {
        let mut m = MaskBuffer::new(width, height);
        m.data[0] = 255;
        m
    }

    #[test]
    fn test_tags() {
        for kind in [
            JobKind::ApplyStamp,
            JobKind::ApplyStrokePath,
            JobKind::ExtractTiles,
            JobKind::ValidateBinary,
            JobKind::EnforceBinary,
            JobKind::Error,
        ] {
            assert_eq!(JobKind::from_tag(kind.tag()), Ok(kind));
        }
        assert_eq!(
            JobKind::from_tag("RESIZE"),
            Err(WorkerError::UnknownMessageType("RESIZE".to_string()))
        );
    }

    #[test]
    fn test_from_tag_checks_payload() {
        let payload = JobPayload::ValidateBinary {
            mask: MaskBuffer::new(4, 4),
        };
        assert_eq!(
            WorkerRequest::from_tag(1, "EXTRACT_TILES", payload.clone()),
            Err(WorkerError::PayloadMismatch {
                expected: JobKind::ExtractTiles,
                found: JobKind::ValidateBinary
            })
        );
        let request = WorkerRequest::from_tag(1, "VALIDATE_BINARY", payload).unwrap();
        assert_eq!(request.kind, JobKind::ValidateBinary);
    }

    #[test]
    fn test_execute_stamp_matches_direct() {
        let response = execute(WorkerRequest::new(
            7,
            JobPayload::ApplyStamp {
                mask: MaskBuffer::new(100, 100),
                x: 50.0,
                y: 50.0,
                size: 20.0,
                mode: BrushMode::Paint,
            },
        ));
        assert_eq!(response.id(), 7);
        assert_eq!(response.kind(), JobKind::ApplyStamp);

        let mut direct = MaskBuffer::new(100, 100);
        brush::apply_stamp(&mut direct.data, 100, 100, 50.0, 50.0, 20.0, BrushMode::Paint);
        match response.into_result().unwrap() {
            JobResult::Stamped { mask, changed, dirty } => {
                assert!(changed);
                assert_eq!(dirty, DirtyRect::new(40, 40, 61, 61));
                assert_eq!(mask, direct);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_invalid_buffer_returns_mask() {
        let mask = MaskBuffer {
            width: 10,
            height: 10,
            data: vec![0; 50],
        };
        let response = execute(WorkerRequest::new(3, JobPayload::EnforceBinary { mask: mask.clone() }));
        assert_eq!(response.kind(), JobKind::Error);
        match response {
            WorkerResponse::Error { id, error, mask: back } => {
                assert_eq!(id, 3);
                assert_eq!(
                    error,
                    WorkerError::InvalidBuffer {
                        expected: 100,
                        actual: 50
                    }
                );
                assert_eq!(back, Some(mask));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_kind_is_rejected() {
        let request = WorkerRequest {
            id: 9,
            kind: JobKind::Error,
            payload: JobPayload::ValidateBinary {
                mask: MaskBuffer::new(2, 2),
            },
        };
        match execute(request) {
            WorkerResponse::Error { error, mask, .. } => {
                assert_eq!(error, WorkerError::UnknownMessageType("ERROR".to_string()));
                assert!(mask.is_some());
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_and_enforce() {
        let mut mask = MaskBuffer::new(4, 1);
        mask.data.copy_from_slice(&[0, 100, 200, 255]);
        match execute(WorkerRequest::new(1, JobPayload::ValidateBinary { mask: mask.clone() }))
            .into_result()
            .unwrap()
        {
            JobResult::Validated { valid, non_binary, .. } => {
                assert!(!valid);
                assert_eq!(non_binary, 2);
            }
            other => panic!("unexpected result {:?}", other),
        }
        match execute(WorkerRequest::new(2, JobPayload::EnforceBinary { mask }))
            .into_result()
            .unwrap()
        {
            JobResult::Enforced { mask, repaired } => {
                assert_eq!(repaired, 2);
                assert_eq!(mask.data, vec![0, 0, 255, 255]);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_encoded_roundtrip_through_handler() {
        let request = WorkerRequest::new(
            11,
            JobPayload::ExtractTiles {
                mask: painted(130, 10),
                tile_size: 64,
            },
        );
        let bytes = encode_request(&request).unwrap();
        let response = decode_response(&handle_encoded(&bytes).unwrap()).unwrap();
        assert_eq!(response.id(), 11);
        match response.into_result().unwrap() {
            JobResult::Tiles { tiles, tile_size, .. } => {
                assert_eq!(tile_size, 64);
                assert_eq!(tiles.len(), 1);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_garbage_bytes_give_serialization_error() {
        let response = decode_response(&handle_encoded(&[0xff, 0x01]).unwrap()).unwrap();
        assert!(matches!(
            response,
            WorkerResponse::Error {
                id: 0,
                error: WorkerError::Serialization(_),
                mask: None
            }
        ));
    }

    #[test]
    fn test_background_worker_wait_and_poll() {
        let mut worker = MaskWorker::new();
        let a = worker.submit(JobPayload::ExtractTiles {
            mask: painted(64, 64),
            tile_size: 32,
        });
        let b = worker.submit(JobPayload::ValidateBinary {
            mask: MaskBuffer::new(8, 8),
        });
        assert_ne!(a, b);

        let resp = worker.wait(b).unwrap();
        assert_eq!(resp.id(), b);
        let rest = worker.wait_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id(), a);
        assert_eq!(worker.in_flight(), 0);
        assert!(worker.poll().is_empty());
    }

    #[test]
    fn test_abandoned_response_is_dropped() {
        let mut worker = MaskWorker::new();
        let id = worker.submit(JobPayload::EnforceBinary {
            mask: MaskBuffer::new(16, 16),
        });
        assert!(worker.abandon(id));
        assert!(!worker.abandon(id));
        assert!(worker.wait_all().is_empty());
        // Give the pool a moment to deliver and make sure nothing leaks out
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(worker.poll().is_empty());
        assert!(matches!(worker.wait(id), Err(WorkerError::Disconnected)));
    }
}
