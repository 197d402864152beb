//! CAR v1 block sets and repository tree lookup.
//!
//! A commit's `blocks` field is a CAR file: a varint-prefixed CBOR header
//! `{version: 1, roots: [cid]}` followed by sections of
//! `varint(len) ++ cid ++ block`. Blocks are indexed by the CID they were
//! shipped under; they are not re-hashed here, that is the verifier's job.
//!
//! Records are located by walking the repository's Merkle search tree from
//! the commit block:
//!
//! ```text
//! commit {data} ──▶ node {l, e: [{p, k, v, t}]}
//!                     │        key_i = key_{i-1}[..p] ++ k
//!                     ├─ l: subtree of keys below e[0]
//!                     └─ t: subtree of keys between e[i] and e[i+1]
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use watchedsky_core::Cid;
use watchedsky_core::cid::{read_uvarint, write_uvarint};

use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct CarHeader {
    version: u64,
    roots: Vec<Cid>,
}

/// The fields of a signed commit block that tree lookup needs.
#[derive(Debug, Serialize, Deserialize)]
struct CommitBlock {
    #[serde(default)]
    did: String,
    #[serde(default)]
    version: u64,
    data: Cid,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeNode {
    #[serde(default)]
    l: Option<Cid>,
    #[serde(default)]
    e: Vec<TreeEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeEntry {
    p: usize,
    k: ByteBuf,
    v: Cid,
    #[serde(default)]
    t: Option<Cid>,
}

/// Blocks from a CAR file, indexed by CID.
#[derive(Debug, Default, Clone)]
pub struct CarBlocks {
    roots: Vec<Cid>,
    blocks: HashMap<Cid, Vec<u8>>,
}

impl CarBlocks {
    /// Parse a CAR v1 file.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (header_len, mut pos) = read_uvarint(bytes)?;
        let header_end = section_end(pos, header_len, bytes.len())?;
        let header: CarHeader = serde_cbor::from_slice(&bytes[pos..header_end])?;
        if header.version != 1 {
            return Err(Error::Decode(format!(
                "unsupported CAR version {}",
                header.version
            )));
        }
        pos = header_end;

        let mut blocks = HashMap::new();
        while pos < bytes.len() {
            let (len, n) = read_uvarint(&bytes[pos..])?;
            pos += n;
            let end = section_end(pos, len, bytes.len())?;
            let (cid, cid_len) = Cid::read_prefix(&bytes[pos..end])?;
            blocks.insert(cid, bytes[pos + cid_len..end].to_vec());
            pos = end;
        }

        Ok(Self {
            roots: header.roots,
            blocks,
        })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// CID recorded in the tree under `path`, starting from `commit`.
    ///
    /// `Ok(None)` means the tree has no such key. A node missing from the
    /// block set is a decode error.
    pub fn record_cid(&self, commit: &Cid, path: &str) -> Result<Option<Cid>> {
        let commit_block: CommitBlock = serde_cbor::from_slice(self.require(commit)?)?;
        let key = path.as_bytes();
        let mut node_cid = Some(commit_block.data);

        while let Some(cid) = node_cid.take() {
            let node: TreeNode = serde_cbor::from_slice(self.require(&cid)?)?;
            let mut prev_key: Vec<u8> = Vec::new();
            let mut subtree = node.l;
            let mut found = None;

            for entry in node.e {
                if entry.p > prev_key.len() {
                    return Err(Error::Decode(format!(
                        "tree entry prefix {} exceeds previous key length {}",
                        entry.p,
                        prev_key.len()
                    )));
                }
                let mut entry_key = prev_key[..entry.p].to_vec();
                entry_key.extend_from_slice(&entry.k);

                match key.cmp(entry_key.as_slice()) {
                    std::cmp::Ordering::Equal => {
                        found = Some(entry.v);
                        break;
                    }
                    std::cmp::Ordering::Less => break,
                    std::cmp::Ordering::Greater => {
                        subtree = entry.t;
                        prev_key = entry_key;
                    }
                }
            }

            if found.is_some() {
                return Ok(found);
            }
            node_cid = subtree;
        }

        Ok(None)
    }

    fn require(&self, cid: &Cid) -> Result<&[u8]> {
        self.get(cid)
            .ok_or_else(|| Error::Decode(format!("block {cid} missing from CAR")))
    }
}

fn section_end(start: usize, len: u64, total: usize) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .filter(|end| *end <= total)
        .ok_or_else(|| Error::Decode(format!("CAR section of {len} bytes is truncated")))
}

/// Encode a CAR v1 file.
pub fn encode_car(roots: &[Cid], blocks: &[(Cid, Vec<u8>)]) -> Result<Vec<u8>> {
    let header = serde_cbor::to_vec(&CarHeader {
        version: 1,
        roots: roots.to_vec(),
    })?;

    let mut out = Vec::new();
    write_uvarint(header.len() as u64, &mut out);
    out.extend_from_slice(&header);
    for (cid, data) in blocks {
        let cid_bytes = cid.as_bytes();
        write_uvarint((cid_bytes.len() + data.len()) as u64, &mut out);
        out.extend_from_slice(cid_bytes);
        out.extend_from_slice(data);
    }
    Ok(out)
}

/// Encode a commit whose tree is a single node holding `entries`.
///
/// Keys are sorted and stored without prefix compression. Returns the
/// commit CID followed by the commit and node blocks.
#[cfg(any(test, feature = "testutil"))]
pub fn encode_flat_commit(did: &str, entries: &[(String, Cid)]) -> Result<(Cid, Vec<(Cid, Vec<u8>)>)> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let node = TreeNode {
        l: None,
        e: sorted
            .into_iter()
            .map(|(path, v)| TreeEntry {
                p: 0,
                k: ByteBuf::from(path.into_bytes()),
                v,
                t: None,
            })
            .collect(),
    };
    let node_block = serde_cbor::to_vec(&node)?;
    let node_cid = Cid::dag_cbor(&node_block);

    let commit_block = serde_cbor::to_vec(&CommitBlock {
        did: did.to_string(),
        version: 3,
        data: node_cid.clone(),
    })?;
    let commit_cid = Cid::dag_cbor(&commit_block);

    Ok((
        commit_cid.clone(),
        vec![(commit_cid, commit_block), (node_cid, node_block)],
    ))
}
