#![forbid(unsafe_code)]

use crate::dnode::Dnode;
use crate::zil::ZilHeader;
use serde::{Deserialize, Serialize};
use zdt_types::{OBJSET_OLD_PHYS_SIZE, OBJSET_PHYS_SIZE, ParseError, ensure_slice, read_le_u64, write_le_u64};

const OS_META_DNODE_OFFSET: usize = 0x000;
const OS_ZIL_HEADER_OFFSET: usize = 0x200;
const OS_TYPE_OFFSET: usize = 0x2C0;
const OS_FLAGS_OFFSET: usize = 0x2C8;
const OS_USERUSED_OFFSET: usize = 0x400;
const OS_GROUPUSED_OFFSET: usize = 0x600;

/// Object-set kinds stored in `os_type`.
pub const DMU_OST_NONE: u64 = 0;
pub const DMU_OST_META: u64 = 1;
pub const DMU_OST_ZFS: u64 = 2;
pub const DMU_OST_ZVOL: u64 = 3;

/// Header block of one object set.
///
/// The accounting dnodes only exist in the current 2048-byte layout; an
/// old-format (1024-byte) header parses with both set to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjsetPhys {
    pub meta_dnode: Dnode,
    pub zil_header: ZilHeader,
    pub os_type: u64,
    pub flags: u64,
    pub userused: Option<Dnode>,
    pub groupused: Option<Dnode>,
}

impl ObjsetPhys {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, OBJSET_OLD_PHYS_SIZE)?;
        let (userused, groupused) = if data.len() >= OBJSET_PHYS_SIZE {
            (
                Some(Dnode::parse(data, OS_USERUSED_OFFSET)?),
                Some(Dnode::parse(data, OS_GROUPUSED_OFFSET)?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            meta_dnode: Dnode::parse(raw, OS_META_DNODE_OFFSET)?,
            zil_header: ZilHeader::parse(raw, OS_ZIL_HEADER_OFFSET)?,
            os_type: read_le_u64(raw, OS_TYPE_OFFSET)?,
            flags: read_le_u64(raw, OS_FLAGS_OFFSET)?,
            userused,
            groupused,
        })
    }

    /// Whether the header carries the user/group accounting dnodes.
    #[must_use]
    pub fn has_accounting(&self) -> bool {
        self.userused.is_some() || self.groupused.is_some()
    }

    /// Physical size this header encodes to.
    #[must_use]
    pub fn phys_size(&self) -> usize {
        if self.has_accounting() {
            OBJSET_PHYS_SIZE
        } else {
            OBJSET_OLD_PHYS_SIZE
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; self.phys_size()];
        self.meta_dnode.encode_into(&mut out, OS_META_DNODE_OFFSET);
        self.zil_header.encode_into(&mut out, OS_ZIL_HEADER_OFFSET);
        write_le_u64(&mut out, OS_TYPE_OFFSET, self.os_type);
        write_le_u64(&mut out, OS_FLAGS_OFFSET, self.flags);
        if self.has_accounting() {
            self.userused
                .clone()
                .unwrap_or_default()
                .encode_into(&mut out, OS_USERUSED_OFFSET);
            self.groupused
                .clone()
                .unwrap_or_default()
                .encode_into(&mut out, OS_GROUPUSED_OFFSET);
        }
        out
    }
}
