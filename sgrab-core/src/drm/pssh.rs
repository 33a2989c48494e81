use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::DrmSystem;

/// Validate a base64 protection payload before it is allowed into a
/// `PsshRecord`. Widevine payloads must be a well-formed `pssh` box whose
/// system id matches; PlayReady payloads are PRO blobs whose little-endian
/// length header must cover the whole buffer. Anything else is discarded
/// by the manifest parser.
pub fn validate_pssh(system: DrmSystem, data_b64: &str) -> bool {
    let Ok(data) = BASE64.decode(data_b64.trim()) else {
        return false;
    };
    match system {
        DrmSystem::Widevine | DrmSystem::Fairplay => validate_pssh_box(system, &data),
        DrmSystem::Playready => validate_pro(&data),
    }
}

fn validate_pssh_box(system: DrmSystem, data: &[u8]) -> bool {
    if data.len() < 32 {
        return false;
    }
    if &data[4..8] != b"pssh" {
        return false;
    }
    let Ok(uuid_bytes) = hex::decode(system.uuid().replace('-', "")) else {
        return false;
    };
    data[12..28] == uuid_bytes[..]
}

fn validate_pro(data: &[u8]) -> bool {
    if data.len() < 10 {
        return false;
    }
    let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    declared == data.len()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a syntactically valid v0 PSSH box for the given system.
    pub fn fake_pssh_box(system: DrmSystem) -> String {
        let uuid = hex::decode(system.uuid().replace('-', "")).unwrap();
        let payload = b"fake-init-data";
        let size = 32 + payload.len() as u32;
        let mut data = Vec::new();
        data.extend_from_slice(&size.to_be_bytes());
        data.extend_from_slice(b"pssh");
        data.extend_from_slice(&[0u8; 4]); // version + flags
        data.extend_from_slice(&uuid);
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        data.extend_from_slice(payload);
        BASE64.encode(data)
    }

    pub fn fake_pro() -> String {
        let mut data = vec![0u8; 24];
        let total = data.len() as u32;
        data[..4].copy_from_slice(&total.to_le_bytes());
        BASE64.encode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{fake_pro, fake_pssh_box};
    use super::*;

    #[test]
    fn widevine_box_accepted() {
        let blob = fake_pssh_box(DrmSystem::Widevine);
        assert!(validate_pssh(DrmSystem::Widevine, &blob));
    }

    #[test]
    fn system_uuid_mismatch_rejected() {
        let blob = fake_pssh_box(DrmSystem::Fairplay);
        assert!(!validate_pssh(DrmSystem::Widevine, &blob));
    }

    #[test]
    fn garbage_rejected() {
        assert!(!validate_pssh(DrmSystem::Widevine, "not base64 at all!!"));
        assert!(!validate_pssh(DrmSystem::Widevine, &BASE64.encode(b"tiny")));
    }

    #[test]
    fn playready_length_header_checked() {
        let blob = fake_pro();
        assert!(validate_pssh(DrmSystem::Playready, &blob));

        let mut data = vec![0u8; 24];
        data[..4].copy_from_slice(&999u32.to_le_bytes());
        assert!(!validate_pssh(DrmSystem::Playready, &BASE64.encode(data)));
    }
}
