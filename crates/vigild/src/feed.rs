//! Live MJPEG feed of annotated frames over HTTP.

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

const BOUNDARY: &str = "frame";

pub type FeedReceiver = watch::Receiver<Option<Bytes>>;

pub fn router(feed: FeedReceiver) -> Router {
    Router::new().route("/video_feed", get(video_feed)).with_state(feed)
}

/// Serve the feed on `addr` until the task is dropped.
pub async fn serve(addr: &str, feed: FeedReceiver) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, feed).await
}

pub async fn serve_on(listener: TcpListener, feed: FeedReceiver) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "video feed listening");
    axum::serve(listener, router(feed)).await
}

async fn video_feed(State(feed): State<FeedReceiver>) -> impl IntoResponse {
    tracing::debug!("video feed client connected");
    let parts = WatchStream::new(feed).filter_map(|frame| frame.map(|jpeg| Ok::<_, Infallible>(multipart_part(&jpeg))));
    (
        [(header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={BOUNDARY}"))],
        Body::from_stream(parts),
    )
}

/// One multipart section carrying a JPEG.
fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(jpeg.len() + 64);
    part.put_slice(format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}
