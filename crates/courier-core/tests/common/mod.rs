// Shared helpers for event bus integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::sync::mpsc;

use courier_core::{Body, BusError, MessageCodec};

pub const WAIT: Duration = Duration::from_secs(5);

/// Receive the next value or fail the test after a few seconds.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

/// Assert nothing else arrives within a short grace period.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(extra)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected message: {extra:?}");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// User codec for [`Point`] that counts local transforms
#[derive(Default)]
pub struct PointCodec {
    pub transforms: AtomicUsize,
}

impl PointCodec {
    pub fn transforms(&self) -> usize {
        self.transforms.load(Ordering::SeqCst)
    }
}

impl MessageCodec for PointCodec {
    fn name(&self) -> &str {
        "point"
    }

    fn encode(&self, body: &Body, buf: &mut BytesMut) -> Result<(), BusError> {
        let point = body
            .as_object::<Point>()
            .ok_or_else(|| BusError::Codec(format!("expected a point, got {}", body.type_name())))?;
        buf.put_i32(point.x);
        buf.put_i32(point.y);
        Ok(())
    }

    fn decode(&self, mut buf: &[u8]) -> Result<Body, BusError> {
        if buf.len() < 8 {
            return Err(BusError::Codec("a point needs 8 bytes".to_string()));
        }
        Ok(Body::object(Point {
            x: buf.get_i32(),
            y: buf.get_i32(),
        }))
    }

    fn transform(&self, body: &Body) -> Body {
        self.transforms.fetch_add(1, Ordering::SeqCst);
        body.clone()
    }
}
