//! H.264 RTP depayloading (RFC 6184)
//!
//! Collects NAL units from RTP payloads and hands out one Annex B access unit
//! per frame, using the RTP marker bit as the frame boundary.

use crate::error::MediaError;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// Reassembles access units from H.264 RTP payloads
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    /// Annex B bytes of the access unit being assembled
    access_unit: Vec<u8>,
    /// Buffer for reassembling FU-A fragmented NAL units
    fragment: Vec<u8>,
    /// Whether we are inside an FU-A sequence that began with a start fragment
    in_fragment: bool,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP payload. Returns the completed access unit when `marker` is set.
    pub fn push(&mut self, payload: &[u8], marker: bool) -> Result<Option<Vec<u8>>, MediaError> {
        if payload.is_empty() {
            return Err(MediaError::Depacketize("empty RTP payload".to_string()));
        }

        let nal_header = payload[0];
        let nal_type = nal_header & 0x1f;

        match nal_type {
            // Single NAL unit
            1..=23 => self.append_nal(payload),

            // STAP-A: aggregated NAL units, each prefixed by a 16-bit size
            NAL_STAP_A => {
                let mut offset = 1;
                let mut found = false;

                while offset + 2 <= payload.len() {
                    let nal_size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;

                    if nal_size == 0 || offset + nal_size > payload.len() {
                        break;
                    }

                    self.append_nal(&payload[offset..offset + nal_size]);
                    offset += nal_size;
                    found = true;
                }

                if !found {
                    self.reset();
                    return Err(MediaError::Depacketize("empty STAP-A packet".to_string()));
                }
            }

            // FU-A: one NAL unit split across packets
            NAL_FU_A => {
                if payload.len() < 2 {
                    self.reset();
                    return Err(MediaError::Depacketize("FU-A packet too small".to_string()));
                }

                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let original_type = fu_header & 0x1f;

                if start {
                    // F and NRI from the FU indicator, type from the FU header
                    self.fragment.clear();
                    self.fragment.push((nal_header & 0xe0) | original_type);
                    self.in_fragment = true;
                } else if !self.in_fragment {
                    // Lost the start fragment; wait for the next one
                    return Ok(None);
                }

                self.fragment.extend_from_slice(&payload[2..]);

                if end {
                    self.access_unit.extend_from_slice(&START_CODE);
                    self.access_unit.append(&mut self.fragment);
                    self.in_fragment = false;
                }
            }

            _ => {
                return Err(MediaError::Depacketize(format!(
                    "unsupported NAL unit type {}",
                    nal_type
                )));
            }
        }

        if marker && !self.access_unit.is_empty() {
            self.in_fragment = false;
            self.fragment.clear();
            return Ok(Some(std::mem::take(&mut self.access_unit)));
        }

        Ok(None)
    }

    /// Drop any partially assembled access unit
    pub fn reset(&mut self) {
        self.access_unit.clear();
        self.fragment.clear();
        self.in_fragment = false;
    }

    fn append_nal(&mut self, nal: &[u8]) {
        self.access_unit.extend_from_slice(&START_CODE);
        self.access_unit.extend_from_slice(nal);
    }
}
