//! Decoding of `x-obex/folder-listing` payloads.
//!
//! ```text
//! <folder-listing version="1.0">
//!   <folder name="data" modified="20140301T101500"/>
//!   <file name="log.txt" size="1024" modified="20140301T101510"/>
//! </folder-listing>
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDateTime;
use roxmltree::{Document, Node, ParsingOptions};

use super::meta::FileMeta;
use crate::error::{ModemError, Result};
use crate::obex::{decode_latin1, parse_time};

/// OBEX TYPE of folder-listing objects.
pub const FOLDER_LISTING_TYPE: &str = "x-obex/folder-listing";

/// System folder hidden from listings.
const RESERVED_FOLDER: &str = "telecom";

/// Decode a Latin-1 folder-listing body into entries under `parent`.
pub fn parse_listing(body: &[u8], parent: &Arc<FileMeta>) -> Result<BTreeSet<FileMeta>> {
    let xml = decode_latin1(body);
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(&xml, options)
        .map_err(|e| ModemError::Listing(format!("invalid folder listing: {}", e)))?;

    let mut entries = BTreeSet::new();
    for node in doc.root_element().children().filter(|n| n.is_element()) {
        let is_directory = match node.tag_name().name() {
            "folder" => true,
            "file" => false,
            _ => continue,
        };

        let name = node
            .attribute("name")
            .ok_or_else(|| ModemError::Listing("entry without name".to_string()))?;
        if name == RESERVED_FOLDER {
            continue;
        }
        let modified = modified(&node)?;

        let entry = if is_directory {
            FileMeta::directory(name, modified, parent.clone())
        } else {
            FileMeta::file(name, size(&node)?, modified, Some(parent.clone()))
        };
        entries.insert(entry);
    }

    Ok(entries)
}

fn modified(node: &Node) -> Result<Option<NaiveDateTime>> {
    match node.attribute("modified") {
        None => Ok(None),
        Some(text) => parse_time(text)
            .map(Some)
            .map_err(|e| ModemError::Listing(format!("bad modified time: {}", e))),
    }
}

fn size(node: &Node) -> Result<u64> {
    match node.attribute("size") {
        None => Ok(0),
        Some(text) => text
            .trim()
            .parse()
            .map_err(|_| ModemError::Listing(format!("bad size {:?}", text))),
    }
}
