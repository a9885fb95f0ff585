//! The read -> identify -> draw -> present -> poll loop.

use crate::overlay::Overlay;
use facetag_core::{DescriptorEncoder, FrameIdentifier, IdentityClassifier, LandmarkExtractor};
use facetag_hw::FrameStream;
use image::RgbImage;

/// Supplies frames until it returns `None` (end of stream or read failure).
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<RgbImage>;
}

/// Shows annotated frames and reports when the user asked to stop.
pub trait FrameSink {
    fn present(&mut self, frame: &RgbImage) -> anyhow::Result<()>;

    /// Polled once per iteration, after [`present`](Self::present).
    fn quit_requested(&self) -> bool;
}

impl FrameSource for FrameStream<'_> {
    fn next_frame(&mut self) -> Option<RgbImage> {
        match FrameStream::next_frame(self) {
            Ok(frame) => {
                tracing::trace!(sequence = frame.sequence, "frame captured");
                Some(frame.image)
            }
            Err(error) => {
                tracing::warn!(%error, "frame read failed, stopping capture");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    SourceEnded,
    QuitRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    pub faces: u64,
    pub stop: StopReason,
}

/// Run until the source ends or the sink asks to quit.
///
/// Frame-level pipeline errors end the loop with an error; per-face
/// failures are already folded into the outcomes by the pipeline.
pub fn run<S, D, L, E, C>(
    source: &mut S,
    sink: &mut D,
    identifier: &mut FrameIdentifier<L, E, C>,
    overlay: &Overlay,
) -> anyhow::Result<LoopStats>
where
    S: FrameSource,
    D: FrameSink,
    L: LandmarkExtractor,
    E: DescriptorEncoder,
    C: IdentityClassifier,
{
    let mut stats = LoopStats {
        frames: 0,
        faces: 0,
        stop: StopReason::SourceEnded,
    };

    while let Some(mut frame) = source.next_frame() {
        let outcomes = identifier
            .identify_frame(&frame)
            .map_err(|e| anyhow::Error::new(e).context(format!("frame {}", stats.frames)))?;

        stats.frames += 1;
        stats.faces += outcomes.len() as u64;
        tracing::debug!(frame = stats.frames, faces = outcomes.len(), "frame identified");

        overlay.draw(&mut frame, &outcomes);
        sink.present(&frame)?;

        if sink.quit_requested() {
            stats.stop = StopReason::QuitRequested;
            break;
        }
    }

    tracing::info!(frames = stats.frames, faces = stats.faces, stop = ?stats.stop, "capture loop finished");
    Ok(stats)
}
