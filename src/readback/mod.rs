//! Asynchronous result retrieval
//!
//! Copies the visible-index buffer and the append counter from the device
//! into a MAP_READ staging buffer, bridges `map_async` through a oneshot
//! channel, and decodes the true element count once the map completes. The
//! caller polls once per update tick; nothing here blocks.

use futures::channel::oneshot;

use crate::compute::CheckBuffers;
use crate::error::{VisibilityError, VisibilityResult};

/// Decoded output of one completed check.
#[derive(Debug, Clone)]
pub struct ReadbackOutput {
    /// Host copy of the full-capacity result buffer, zero tail included.
    pub visible: Vec<u32>,
    /// True element count per the two-consecutive-zeros rule.
    pub visible_count: usize,
    /// GPU-side atomic append count, surfaced for diagnostics.
    pub counted_visible: u32,
}

/// Apply the two-consecutive-zeros rule to a zero-filled result buffer.
///
/// Scan from the start; the first position where the current and the next
/// element are both zero marks the start of the zero-fill tail, and
/// everything before it is valid. Without such a pair the whole buffer is
/// valid; a full result legitimately ends in a lone zero when triangle 0 is
/// appended last. The rule misreads a result whose genuine triangle 0 is
/// immediately followed by the fill tail; the GPU counter read back
/// alongside lets callers spot that inherited ambiguity.
pub fn visible_len(indices: &[u32]) -> usize {
    for i in 0..indices.len().saturating_sub(1) {
        if indices[i] == 0 && indices[i + 1] == 0 {
            return i;
        }
    }
    indices.len()
}

/// One in-flight device-to-host transfer of the result buffer.
pub struct ResultReadback {
    staging: wgpu::Buffer,
    receiver: oneshot::Receiver<Result<(), wgpu::BufferAsyncError>>,
    triangle_count: u32,
}

impl ResultReadback {
    /// Record the copies into a fresh staging buffer and submit them, then
    /// request the asynchronous map. The counter word rides after the result
    /// slots in the same staging buffer so one map covers both.
    pub fn begin(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        buffers: &CheckBuffers,
    ) -> Self {
        let slot_bytes = (buffers.triangle_count as u64) * 4;

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visible Result Staging Buffer"),
            size: slot_bytes + 4,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Result Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&buffers.visible, 0, &staging, 0, slot_bytes);
        encoder.copy_buffer_to_buffer(&buffers.counter, 0, &staging, slot_bytes, 4);
        queue.submit(Some(encoder.finish()));

        let (sender, receiver) = oneshot::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                sender.send(result).ok();
            });

        Self {
            staging,
            receiver,
            triangle_count: buffers.triangle_count,
        }
    }

    /// Poll the transfer. Returns `None` while still in flight.
    pub fn poll(&mut self, device: &wgpu::Device) -> Option<VisibilityResult<ReadbackOutput>> {
        device.poll(wgpu::Maintain::Poll);

        match self.receiver.try_recv() {
            Ok(None) => None,
            Ok(Some(Ok(()))) => Some(self.decode()),
            Ok(Some(Err(e))) => Some(Err(VisibilityError::Readback(e.to_string()))),
            Err(_) => Some(Err(VisibilityError::Readback(
                "map_async callback dropped".to_string(),
            ))),
        }
    }

    fn decode(&self) -> VisibilityResult<ReadbackOutput> {
        let slice = self.staging.slice(..);
        let data = slice.get_mapped_range();
        let words: &[u32] = bytemuck::cast_slice(&data);

        let visible = words[..self.triangle_count as usize].to_vec();
        let counted_visible = words[self.triangle_count as usize];
        drop(data);
        self.staging.unmap();

        let visible_count = visible_len(&visible);
        if visible_count != counted_visible as usize {
            log::warn!(
                "[ResultReadback::decode] scan count {} disagrees with GPU counter {} \
                 (ambiguous zero-prefix result)",
                visible_count,
                counted_visible
            );
        }

        Ok(ReadbackOutput {
            visible,
            visible_count,
            counted_visible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tail_is_excluded() {
        assert_eq!(visible_len(&[5, 3, 9, 0, 0, 0]), 3);
    }

    #[test]
    fn full_buffer_has_no_tail() {
        assert_eq!(visible_len(&[2, 1, 3]), 3);
    }

    #[test]
    fn interior_zero_is_a_valid_index() {
        // Triangle 0 visible but not immediately followed by the fill tail
        assert_eq!(visible_len(&[0, 4, 1, 0, 0]), 3);
        assert_eq!(visible_len(&[3, 0, 7, 0, 0]), 3);
    }

    #[test]
    fn lone_trailing_zero_counts_as_data() {
        // A full buffer may end in a single zero when triangle 0 was the
        // last append; only a zero PAIR starts the tail.
        assert_eq!(visible_len(&[3, 1, 2, 0]), 4);
        assert_eq!(visible_len(&[5, 0]), 2);
    }

    #[test]
    fn empty_and_all_zero_buffers() {
        assert_eq!(visible_len(&[]), 0);
        assert_eq!(visible_len(&[0, 0, 0, 0]), 0);
    }

    #[test]
    fn lone_triangle_zero_is_the_known_ambiguity() {
        // Triangle 0 genuinely visible, immediately followed by fill: the
        // scan cannot distinguish it from an empty result.
        assert_eq!(visible_len(&[0, 0, 0]), 0);
    }
}
