use cid::{Cid, Version};
use multihash::{Code, MultihashDigest};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

use crate::error::Error;

/// All metadata of a CID, without the actual digest.
///
/// Blocks travel as prefix plus data, the receiver rehashes the data to rebuild the cid.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Prefix {
    pub version: Version,
    pub codec: u64,
    pub mh_type: Code,
    pub mh_len: usize,
}

impl Prefix {
    /// Parses a prefix from its encoded form.
    pub fn new(data: &[u8]) -> Result<Prefix, Error> {
        let (raw_version, remain) = varint_decode::u64(data)?;
        let version = Version::try_from(raw_version)?;
        let (codec, remain) = varint_decode::u64(remain)?;
        let (mh_type, remain) = varint_decode::u64(remain)?;
        let (mh_len, _remain) = varint_decode::usize(remain)?;

        Ok(Prefix {
            version,
            codec,
            mh_type: Code::try_from(mh_type)?,
            mh_len,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(4);
        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(self.version.into(), &mut buf));
        res.extend_from_slice(varint_encode::u64(self.codec, &mut buf));
        res.extend_from_slice(varint_encode::u64(self.mh_type.into(), &mut buf));
        res.extend_from_slice(varint_encode::u64(self.mh_len as u64, &mut buf));
        res
    }

    /// Hashes `data` and builds the matching cid.
    pub fn to_cid(&self, data: &[u8]) -> Result<Cid, Error> {
        let mh = self.mh_type.digest(data);
        let cid = Cid::new(self.version, self.codec, mh)?;
        Ok(cid)
    }
}

impl From<&Cid> for Prefix {
    fn from(cid: &Cid) -> Self {
        Self {
            version: cid.version(),
            codec: cid.codec(),
            // blocks are only ever built from known hash codes, see `Block::verify`
            mh_type: Code::try_from(cid.hash().code()).unwrap_or(Code::Sha2_256),
            mh_len: cid.hash().digest().len(),
        }
    }
}
