/// Keep only `moof` and `mdat` boxes from a fragmented-MP4 segment.
///
/// Boxes are laid out as big-endian `size: u32` followed by a 4-byte
/// ascii type. Parsing stops at a size below 8 or a box overrunning the
/// buffer; unknown box types are skipped, not errors.
pub fn filter_moof_mdat(data: &[u8]) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= data.len() {
        let size = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        if size < 8 || offset + size > data.len() {
            break;
        }
        let box_type = &data[offset + 4..offset + 8];
        if box_type == b"moof" || box_type == b"mdat" {
            kept.extend_from_slice(&data[offset..offset + size]);
        }
        offset += size;
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let size = 8 + payload.len() as u32;
        let mut data = Vec::new();
        data.extend_from_slice(&size.to_be_bytes());
        data.extend_from_slice(box_type);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn keeps_moof_and_mdat_in_order() {
        let mut segment = Vec::new();
        segment.extend(make_box(b"styp", b"brand"));
        let moof = make_box(b"moof", b"fragment-header");
        let mdat = make_box(b"mdat", b"media-data");
        segment.extend(moof.clone());
        segment.extend(make_box(b"sidx", b"index"));
        segment.extend(mdat.clone());

        let mut expected = moof;
        expected.extend(mdat);
        assert_eq!(filter_moof_mdat(&segment), expected);
    }

    #[test]
    fn stops_on_undersized_box() {
        let mut segment = make_box(b"moof", b"ok");
        segment.extend_from_slice(&4u32.to_be_bytes());
        segment.extend_from_slice(b"bad!");
        segment.extend(make_box(b"mdat", b"unreached"));
        let filtered = filter_moof_mdat(&segment);
        assert_eq!(filtered, make_box(b"moof", b"ok"));
    }

    #[test]
    fn stops_on_overrun() {
        let mut segment = Vec::new();
        segment.extend_from_slice(&64u32.to_be_bytes());
        segment.extend_from_slice(b"mdat");
        segment.extend_from_slice(b"short");
        assert!(filter_moof_mdat(&segment).is_empty());
    }

    #[test]
    fn empty_input_is_fine() {
        assert!(filter_moof_mdat(&[]).is_empty());
    }
}
