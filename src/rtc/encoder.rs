use std::fs::File;

use anyhow::Result;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP9};
use webrtc::media::io::h264_writer::H264Writer;
use webrtc::media::io::ivf_reader::IVFFileHeader;
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::Writer;

/// Picks the container writer for an inbound track: IVF for VP9, Annex-B
/// byte stream for H.264. Returns None for codecs we do not record.
pub fn new_encoder(mime_type: &str, writer: File) -> Result<Option<Box<dyn Writer + Send>>> {
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9) {
        let header = IVFFileHeader {
            signature: *b"DKIF",
            version: 0,
            header_size: 32,
            four_cc: *b"VP90",
            width: 640,
            height: 480,
            timebase_denominator: 30,
            timebase_numerator: 1,
            num_frames: 900,
            unused: 0,
        };
        let encoder = IVFWriter::new(writer, &header)?;
        return Ok(Some(Box::new(encoder)));
    }
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        return Ok(Some(Box::new(H264Writer::new(writer))));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch_file(dir: &std::path::Path, name: &str) -> File {
        File::create(dir.join(name)).unwrap()
    }

    #[test]
    fn selects_ivf_for_vp9() {
        let dir = tempdir().unwrap();
        let encoder = new_encoder(MIME_TYPE_VP9, scratch_file(dir.path(), "a.raw")).unwrap();
        assert!(encoder.is_some());
    }

    #[test]
    fn selects_annex_b_for_h264() {
        let dir = tempdir().unwrap();
        let encoder = new_encoder(MIME_TYPE_H264, scratch_file(dir.path(), "b.raw")).unwrap();
        assert!(encoder.is_some());
    }

    #[test]
    fn unknown_mime_is_not_an_error() {
        let dir = tempdir().unwrap();
        let encoder = new_encoder("video/flv", scratch_file(dir.path(), "c.raw")).unwrap();
        assert!(encoder.is_none());
    }
}
