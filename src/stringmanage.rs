//! 文字列管理
//!
//! ロードイメージ上のバイト列をUTF-8へ正規化してアドレスで
//! キャッシュする。エンコーディングはUTF-8 / UTF-16 / UTF-32
//! （両エンディアン）を判別し、不正な列は空として扱う。

use crate::address::Address;
use crate::error::{CoreError, CoreResult};
use crate::scope::crc32;
use std::collections::BTreeMap;

/// ロードイメージのインターフェース（外部コラボレータ）
pub trait LoadImage {
    /// addrからbufを満たすだけ読み取る。未マップはDataUnavailable。
    fn load_fill(&self, buf: &mut [u8], addr: Address) -> CoreResult<()>;
}

/// 正規化済みの文字列データ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringData {
    /// 読み取り失敗または不正なエンコーディング
    pub found_bad: bool,
    /// UTF-8に正規化したバイト列（終端は含まない）
    pub bytes: Vec<u8>,
}

/// 文字列キャッシュ
#[derive(Debug)]
pub struct StringManager {
    /// 1文字列あたりの最大文字数
    maximum_chars: usize,
    cache: BTreeMap<(Address, u32), StringData>,
}

impl StringManager {
    pub fn new(maximum_chars: usize) -> Self {
        Self {
            maximum_chars,
            cache: BTreeMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// アドレスの文字列をデコードして返す（キャッシュあり）
    ///
    /// charsizeは1/2/4。失敗時は空スライス。
    pub fn get_string_data(
        &mut self,
        addr: Address,
        charsize: u32,
        big_endian: bool,
        loader: &dyn LoadImage,
    ) -> &[u8] {
        let key = (addr, charsize);
        if !self.cache.contains_key(&key) {
            let data = self.decode_string(addr, charsize, big_endian, loader);
            self.cache.insert(key, data);
        }
        self.cache
            .get(&key)
            .map(|d| d.bytes.as_slice())
            .unwrap_or(&[])
    }

    /// デコードに成功した非空文字列か
    pub fn is_string(
        &mut self,
        addr: Address,
        charsize: u32,
        big_endian: bool,
        loader: &dyn LoadImage,
    ) -> bool {
        !self.get_string_data(addr, charsize, big_endian, loader).is_empty()
    }

    fn decode_string(
        &self,
        addr: Address,
        charsize: u32,
        big_endian: bool,
        loader: &dyn LoadImage,
    ) -> StringData {
        let mut buf = vec![0u8; self.maximum_chars * charsize as usize];
        if let Err(CoreError::DataUnavailable { .. }) = loader.load_fill(&mut buf, addr) {
            // 未マップ領域は空文字列として回復する
            return StringData {
                found_bad: true,
                bytes: Vec::new(),
            };
        }
        match charsize {
            1 => {
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                match std::str::from_utf8(&buf[..end]) {
                    Ok(s) => StringData {
                        found_bad: false,
                        bytes: s.as_bytes().to_vec(),
                    },
                    Err(_) => StringData {
                        found_bad: true,
                        bytes: Vec::new(),
                    },
                }
            }
            2 => {
                let mut units = Vec::new();
                for chunk in buf.chunks_exact(2) {
                    let u = if big_endian {
                        u16::from_be_bytes([chunk[0], chunk[1]])
                    } else {
                        u16::from_le_bytes([chunk[0], chunk[1]])
                    };
                    if u == 0 {
                        break;
                    }
                    units.push(u);
                }
                match char::decode_utf16(units.iter().copied())
                    .collect::<Result<String, _>>()
                {
                    Ok(s) => StringData {
                        found_bad: false,
                        bytes: s.into_bytes(),
                    },
                    Err(_) => StringData {
                        found_bad: true,
                        bytes: Vec::new(),
                    },
                }
            }
            4 => {
                let mut out = String::new();
                for chunk in buf.chunks_exact(4) {
                    let u = if big_endian {
                        u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
                    } else {
                        u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
                    };
                    if u == 0 {
                        break;
                    }
                    match char::from_u32(u) {
                        Some(c) => out.push(c),
                        None => {
                            return StringData {
                                found_bad: true,
                                bytes: Vec::new(),
                            }
                        }
                    }
                }
                StringData {
                    found_bad: false,
                    bytes: out.into_bytes(),
                }
            }
            _ => StringData {
                found_bad: true,
                bytes: Vec::new(),
            },
        }
    }

    /// イメージ外の内部文字列を登録し、その擬似アドレスを返す
    ///
    /// キーはバイト列の64bit CRCをオフセット上位半分へXOR混合
    /// したもの。
    pub fn register_internal(&mut self, bytes: &[u8], base: Address) -> Address {
        let lo = crc32(bytes) as u64;
        let rev: Vec<u8> = bytes.iter().rev().copied().collect();
        let hi = crc32(&rev) as u64;
        let hash = (hi << 32) | lo;
        let offset = base.offset ^ (hash & 0xffff_ffff_0000_0000);
        let addr = Address::new(base.space, offset);
        self.cache.insert(
            (addr, 1),
            StringData {
                found_bad: false,
                bytes: bytes.to_vec(),
            },
        );
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceIndex;

    struct VecImage {
        base: u64,
        data: Vec<u8>,
    }

    impl LoadImage for VecImage {
        fn load_fill(&self, buf: &mut [u8], addr: Address) -> CoreResult<()> {
            let start = addr
                .offset
                .checked_sub(self.base)
                .ok_or(CoreError::DataUnavailable {
                    addr,
                    size: buf.len() as u32,
                })? as usize;
            if start >= self.data.len() {
                return Err(CoreError::DataUnavailable {
                    addr,
                    size: buf.len() as u32,
                });
            }
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = self.data.get(start + i).copied().unwrap_or(0);
            }
            Ok(())
        }
    }

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(2), off)
    }

    #[test]
    fn test_utf8_decode() {
        let img = VecImage {
            base: 0x1000,
            data: b"hello\0world\0".to_vec(),
        };
        let mut mgr = StringManager::new(64);
        assert_eq!(mgr.get_string_data(addr(0x1000), 1, false, &img), b"hello");
        assert_eq!(mgr.get_string_data(addr(0x1006), 1, false, &img), b"world");
        assert!(mgr.is_string(addr(0x1000), 1, false, &img));
    }

    #[test]
    fn test_utf16_decode() {
        let mut data = Vec::new();
        for c in "abc".encode_utf16() {
            data.extend_from_slice(&c.to_le_bytes());
        }
        data.extend_from_slice(&[0, 0]);
        let img = VecImage { base: 0x2000, data };
        let mut mgr = StringManager::new(64);
        assert_eq!(mgr.get_string_data(addr(0x2000), 2, false, &img), b"abc");
    }

    #[test]
    fn test_invalid_utf8_is_empty() {
        let img = VecImage {
            base: 0x1000,
            data: vec![0xff, 0xfe, 0x41, 0x00],
        };
        let mut mgr = StringManager::new(64);
        assert_eq!(mgr.get_string_data(addr(0x1000), 1, false, &img), b"");
    }

    #[test]
    fn test_unmapped_recovers_empty() {
        let img = VecImage {
            base: 0x1000,
            data: b"x\0".to_vec(),
        };
        let mut mgr = StringManager::new(16);
        assert_eq!(mgr.get_string_data(addr(0x8000), 1, false, &img), b"");
        assert!(!mgr.is_string(addr(0x8000), 1, false, &img));
    }

    #[test]
    fn test_internal_string_key() {
        let mut mgr = StringManager::new(16);
        let base = addr(0x1234);
        let a1 = mgr.register_internal(b"alpha", base);
        let a2 = mgr.register_internal(b"beta", base);
        // 内容が違えば擬似アドレスも違い、下位半分は保存される
        assert_ne!(a1, a2);
        assert_eq!(a1.offset & 0xffff_ffff, 0x1234);

        struct NullImage;
        impl LoadImage for NullImage {
            fn load_fill(&self, _buf: &mut [u8], addr: Address) -> CoreResult<()> {
                Err(CoreError::DataUnavailable { addr, size: 0 })
            }
        }
        assert_eq!(mgr.get_string_data(a1, 1, false, &NullImage), b"alpha");
    }
}
