//! Piecewise-linear envelopes (volume, panning, pitch/filter)

use crate::MAX_ENVELOPE_NODES;

/// One envelope node: a (tick, value) pair.
///
/// Values are 0-64. Volume envelopes use the full range directly; panning and
/// pitch envelopes treat 32 as center and read the value as -32..+32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeNode {
    pub tick: u16,
    pub value: u8,
}

impl EnvelopeNode {
    pub const fn new(tick: u16, value: u8) -> Self {
        Self { tick, value }
    }
}

/// A piecewise-linear envelope with optional loop and sustain regions.
///
/// Loop and sustain bounds are node indices, not ticks. The player reads
/// envelopes every tick, so the invariants here (sorted ticks, in-range
/// indices) must hold before playback starts; [`Envelope::sanitize`] enforces
/// them after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Envelope nodes, ticks non-decreasing.
    pub nodes: Vec<EnvelopeNode>,
    /// Loop begin node index.
    pub loop_start: u8,
    /// Loop end node index.
    pub loop_end: u8,
    /// Sustain loop begin node index.
    pub sustain_start: u8,
    /// Sustain loop end node index.
    pub sustain_end: u8,
    pub flags: EnvelopeFlags,
}

impl Default for Envelope {
    fn default() -> Self {
        // Flat envelope at full value, disabled until an editor turns it on.
        Self {
            nodes: vec![EnvelopeNode::new(0, 64), EnvelopeNode::new(100, 64)],
            loop_start: 0,
            loop_end: 0,
            sustain_start: 0,
            sustain_end: 0,
            flags: EnvelopeFlags::empty(),
        }
    }
}

impl Envelope {
    pub fn is_enabled(&self) -> bool {
        self.flags.contains(EnvelopeFlags::ENABLED)
    }

    pub fn has_loop(&self) -> bool {
        self.flags.contains(EnvelopeFlags::LOOP)
    }

    pub fn has_sustain(&self) -> bool {
        self.flags.contains(EnvelopeFlags::SUSTAIN)
    }

    pub fn carries(&self) -> bool {
        self.flags.contains(EnvelopeFlags::CARRY)
    }

    /// Pitch envelopes with this flag drive the voice filter cutoff instead
    /// of bending the period.
    pub fn is_filter(&self) -> bool {
        self.flags.contains(EnvelopeFlags::FILTER)
    }

    /// Tick of the given node, 0 if the index is out of range.
    #[inline]
    pub fn node_tick(&self, index: u8) -> u16 {
        self.nodes.get(index as usize).map_or(0, |n| n.tick)
    }

    /// Value of the given node, 0 if the index is out of range.
    #[inline]
    pub fn node_value(&self, index: u8) -> u8 {
        self.nodes.get(index as usize).map_or(0, |n| n.value)
    }

    /// Tick of the last node (the envelope's end).
    #[inline]
    pub fn end_tick(&self) -> u16 {
        self.nodes.last().map_or(0, |n| n.tick)
    }

    /// Clamp the envelope into a state the player can trust: at most
    /// [`MAX_ENVELOPE_NODES`] nodes, non-decreasing ticks, values 0-64,
    /// ordered in-range loop/sustain indices.
    pub fn sanitize(&mut self) {
        self.nodes.truncate(MAX_ENVELOPE_NODES);
        let mut last_tick = 0u16;
        for node in &mut self.nodes {
            if node.tick < last_tick {
                node.tick = last_tick;
            }
            last_tick = node.tick;
            node.value = node.value.min(64);
        }

        let last = self.nodes.len().saturating_sub(1) as u8;
        self.loop_start = self.loop_start.min(last);
        self.loop_end = self.loop_end.clamp(self.loop_start, last);
        self.sustain_start = self.sustain_start.min(last);
        self.sustain_end = self.sustain_end.clamp(self.sustain_start, last);
    }
}

/// Envelope behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeFlags(u8);

impl EnvelopeFlags {
    /// Envelope is evaluated at all.
    pub const ENABLED: Self = Self(0x01);
    /// Loop region active.
    pub const LOOP: Self = Self(0x02);
    /// Sustain region active while the note is held.
    pub const SUSTAIN: Self = Self(0x04);
    /// Keep the envelope position across a new note.
    pub const CARRY: Self = Self(0x08);
    /// Pitch envelope drives the filter cutoff instead of the period.
    pub const FILTER: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for EnvelopeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_sorts_and_clamps() {
        let mut env = Envelope {
            nodes: vec![
                EnvelopeNode::new(0, 64),
                EnvelopeNode::new(10, 80),
                EnvelopeNode::new(5, 32),
            ],
            loop_start: 7,
            loop_end: 2,
            sustain_start: 1,
            sustain_end: 0,
            flags: EnvelopeFlags::ENABLED | EnvelopeFlags::LOOP,
        };
        env.sanitize();

        assert_eq!(env.nodes[1].value, 64, "values clamp to 64");
        assert_eq!(env.nodes[2].tick, 10, "ticks forced non-decreasing");
        assert!(env.loop_start <= env.loop_end);
        assert!((env.loop_end as usize) < env.nodes.len());
        assert!(env.sustain_start <= env.sustain_end);
    }

    #[test]
    fn flag_queries() {
        let env = Envelope {
            flags: EnvelopeFlags::ENABLED | EnvelopeFlags::SUSTAIN | EnvelopeFlags::CARRY,
            ..Default::default()
        };
        assert!(env.is_enabled());
        assert!(env.has_sustain());
        assert!(env.carries());
        assert!(!env.has_loop());
        assert!(!env.is_filter());
    }
}
