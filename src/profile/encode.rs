use crate::pprofpb::Profile;
#[cfg(test)]
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use std::io::Write;

/// Serializes a profile the way pprof files are stored: gzip compressed protobuf.
pub fn encode_gzip(profile: &Profile) -> anyhow::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&profile.encode_to_vec())?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
pub fn decode_gzip(raw: &[u8]) -> anyhow::Result<Profile> {
    use std::io::Read;

    if raw.len() < 2 || raw[0] != 0x1f || raw[1] != 0x8b {
        anyhow::bail!("profile is not gzip compressed");
    }

    let mut decompressed = Vec::new();
    GzDecoder::new(raw).read_to_end(&mut decompressed)?;
    Ok(Profile::decode(decompressed.as_slice())?)
}
