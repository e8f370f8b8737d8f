use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use rand::RngCore;
use regex::Regex;
use sha1::{Digest, Sha1};

use crate::models::MagnetFile;

#[derive(Debug, Clone, PartialEq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    pub fn get(&self, key: &str) -> Option<&Bencode> {
        match self {
            Self::Dict(map) => map.get(key.as_bytes()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match self {
            Self::Bytes(raw) => Some(String::from_utf8_lossy(raw).into_owned()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    // Byte span of the top-level "info" value, needed for the info hash.
    info_span: Option<(usize, usize)>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            info_span: None,
        }
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .context("unexpected end of bencode data")
    }

    fn value(&mut self, depth: usize) -> Result<Bencode> {
        if depth > 64 {
            bail!("bencode nesting too deep");
        }
        match self.peek()? {
            b'i' => self.int(),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Bencode::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.bytes()?;
                    let start = self.pos;
                    let value = self.value(depth + 1)?;
                    if depth == 0 && key == b"info" {
                        self.info_span = Some((start, self.pos));
                    }
                    map.insert(key, value);
                }
                self.pos += 1;
                Ok(Bencode::Dict(map))
            }
            b'0'..=b'9' => Ok(Bencode::Bytes(self.bytes()?)),
            other => bail!("invalid bencode token {:?} at {}", other as char, self.pos),
        }
    }

    fn int(&mut self) -> Result<Bencode> {
        self.pos += 1;
        let end = self.data[self.pos..]
            .iter()
            .position(|b| *b == b'e')
            .context("unterminated bencode integer")?;
        let raw = std::str::from_utf8(&self.data[self.pos..self.pos + end])
            .context("invalid bencode integer")?;
        let value = raw
            .parse::<i64>()
            .with_context(|| format!("invalid bencode integer {raw}"))?;
        self.pos += end + 1;
        Ok(Bencode::Int(value))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let colon = self.data[self.pos..]
            .iter()
            .position(|b| *b == b':')
            .context("missing bencode string length")?;
        let raw = std::str::from_utf8(&self.data[self.pos..self.pos + colon])
            .context("invalid bencode string length")?;
        let len = raw
            .parse::<usize>()
            .with_context(|| format!("invalid bencode string length {raw}"))?;
        let start = self.pos + colon + 1;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .context("bencode string exceeds input")?;
        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }
}

pub fn decode(data: &[u8]) -> Result<Bencode> {
    Decoder::new(data).value(0)
}

#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub name: String,
    pub info_hash: String,
    pub size: i64,
    pub files: Vec<MagnetFile>,
}

/// Parses `.torrent` metainfo. File ids are the 1-based indexes aria2 uses for
/// `select-file`.
pub fn parse_torrent(data: &[u8]) -> Result<TorrentMeta> {
    let mut decoder = Decoder::new(data);
    let root = decoder.value(0).context("failed decoding torrent")?;
    let (start, end) = decoder.info_span.context("torrent has no info dictionary")?;
    let info = root.get("info").context("torrent has no info dictionary")?;

    let info_hash = hex(&Sha1::digest(&data[start..end]));
    let name = info
        .get("name.utf-8")
        .or_else(|| info.get("name"))
        .and_then(Bencode::as_str)
        .unwrap_or_else(|| info_hash.clone());

    let mut files = Vec::new();
    if let Some(entries) = info.get("files").and_then(Bencode::as_list) {
        for (i, entry) in entries.iter().enumerate() {
            let parts = entry
                .get("path.utf-8")
                .or_else(|| entry.get("path"))
                .and_then(Bencode::as_list)
                .unwrap_or_default()
                .iter()
                .filter_map(Bencode::as_str)
                .collect::<Vec<_>>();
            let rel = parts.join("/");
            let size = entry.get("length").and_then(Bencode::as_int).unwrap_or(0);
            files.push(MagnetFile {
                id: (i + 1).to_string(),
                name: parts.last().cloned().unwrap_or_default(),
                path: format!("{name}/{rel}"),
                size,
                index: i as i64 + 1,
                ..Default::default()
            });
        }
    } else {
        let size = info.get("length").and_then(Bencode::as_int).unwrap_or(0);
        files.push(MagnetFile {
            id: "1".to_string(),
            name: name.clone(),
            path: name.clone(),
            size,
            index: 1,
            ..Default::default()
        });
    }

    let size = files
        .iter()
        .try_fold(0i64, |total, file| {
            if file.size < 0 {
                return None;
            }
            total.checked_add(file.size)
        })
        .context("torrent file lengths are negative or overflow")?;
    Ok(TorrentMeta {
        name,
        info_hash,
        size,
        files,
    })
}

pub fn is_magnet(source: &str) -> bool {
    source.trim_start().to_ascii_lowercase().starts_with("magnet:")
}

pub fn magnet_info_hash(source: &str) -> Option<String> {
    if !is_magnet(source) {
        return None;
    }
    let re = Regex::new(r"(?i)xt=urn:btih:([a-z0-9]{32,40})").ok()?;
    re.captures(source)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Value of the `dn` parameter, percent-decoded.
pub fn magnet_display_name(source: &str) -> Option<String> {
    let query = source.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "dn")
        .map(|(_, value)| percent_decode(value))
        .filter(|name| !name.is_empty())
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let code = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match code {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A fresh aria2 gid: 8 random bytes as lowercase hex.
pub fn generate_gid() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

/// rclone job ids are signed; a hex gid maps onto the positive range.
pub fn gid_to_job_id(gid: &str) -> i64 {
    u64::from_str_radix(gid, 16)
        .map(|v| (v & 0x7FFF_FFFF_FFFF_FFFF) as i64)
        .unwrap_or(0)
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
