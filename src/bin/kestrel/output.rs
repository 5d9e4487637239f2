//! Rendering helpers: TLV trees for humans, JSON values for pipes.

use kestrel::ber::{Tlv, Value};
use kestrel::emv::tags;
use owo_colors::OwoColorize;
use serde_json::json;

/// Prints a parsed TLV forest as an indented tree, one node per line, with
/// the dictionary name next to each tag and printable values shown as text.
pub fn print_tree(tlvs: &[Tlv], depth: usize) {
    for tlv in tlvs {
        let pad = "  ".repeat(depth);
        match &tlv.value {
            Value::Constructed(kids) => {
                println!(
                    "{pad}{} {}",
                    format!("{}", tlv.tag).cyan(),
                    tags::name(tlv.tag).dimmed(),
                );
                print_tree(kids, depth + 1);
            }
            Value::Primitive(value) => {
                let rendered = match printable(value) {
                    Some(text) => format!("{} \"{}\"", hex::encode_upper(value), text.green()),
                    None => hex::encode_upper(value),
                };
                println!(
                    "{pad}{} {} {rendered}",
                    format!("{}", tlv.tag).cyan(),
                    tags::name(tlv.tag).dimmed(),
                );
            }
        }
    }
}

/// The same forest as a JSON array, nesting children.
pub fn tlv_to_json(tlvs: &[Tlv]) -> serde_json::Value {
    json!(tlvs
        .iter()
        .map(|tlv| match &tlv.value {
            Value::Constructed(kids) => json!({
                "tag": format!("{}", tlv.tag),
                "name": tags::name(tlv.tag),
                "children": tlv_to_json(kids),
            }),
            Value::Primitive(value) => json!({
                "tag": format!("{}", tlv.tag),
                "name": tags::name(tlv.tag),
                "value": hex::encode_upper(value),
            }),
        })
        .collect::<Vec<_>>())
}

fn printable(value: &[u8]) -> Option<&str> {
    if !value.is_empty() && value.iter().all(|&b| (0x20..0x7F).contains(&b)) {
        std::str::from_utf8(value).ok()
    } else {
        None
    }
}
