//! Print every DDT2 frame seen on a TCP tunnel, using the async codec.
//!
//! Run with:
//!   cargo run --example async-monitor --features async -- 127.0.0.1:9000

use futures_util::StreamExt;
use ratlink::frame::Ddt2Codec;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string());
    let armored = std::env::args().any(|arg| arg == "--armored");

    let stream = TcpStream::connect(&addr).await?;
    eprintln!("Monitoring {addr} (armored: {armored})");

    let mut frames = FramedRead::new(stream, Ddt2Codec::new(armored));
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        println!(
            "{} -> {} session={} type={} seq={} {} bytes",
            frame.src,
            frame.dst,
            frame.session,
            frame.kind,
            frame.seq,
            frame.data.len()
        );
    }
    Ok(())
}
