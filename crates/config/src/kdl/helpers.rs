//! Helpers for reading values out of KDL documents.
//!
//! Settings are written as child nodes with positional arguments, e.g.
//! `dir "/etc/ssl/web"` or `sans "a.example" "b.example"`.

use ::kdl::{KdlDocument, KdlNode, KdlValue};

/// First argument of the first node called `name`, as a string
pub fn get_string_entry(doc: &KdlDocument, name: &str) -> Option<String> {
    first_arg(doc, name)
        .and_then(KdlValue::as_string)
        .map(str::to_string)
}

/// All string arguments of every node called `name`
pub fn get_string_args(doc: &KdlDocument, name: &str) -> Vec<String> {
    doc.nodes()
        .iter()
        .filter(|node| node.name().value() == name)
        .flat_map(|node| node.entries().iter())
        .filter(|entry| entry.name().is_none())
        .filter_map(|entry| entry.value().as_string())
        .map(str::to_string)
        .collect()
}

/// First argument of the first node called `name`, as an integer
pub fn get_int_entry(doc: &KdlDocument, name: &str) -> Option<i128> {
    first_arg(doc, name).and_then(KdlValue::as_integer)
}

/// First argument of the first node called `name`, as a boolean
pub fn get_bool_entry(doc: &KdlDocument, name: &str) -> Option<bool> {
    first_arg(doc, name).and_then(KdlValue::as_bool)
}

/// Whether a node called `name` is present but its first argument is not a string
pub fn has_non_string(doc: &KdlDocument, name: &str) -> bool {
    first_arg(doc, name).is_some_and(|v| v.as_string().is_none())
}

/// Whether a node called `name` is present but its first argument is not an integer
pub fn has_non_integer(doc: &KdlDocument, name: &str) -> bool {
    first_arg(doc, name).is_some_and(|v| v.as_integer().is_none())
}

/// Children of the block node called `name`
pub fn get_block<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlDocument> {
    doc.get(name).and_then(KdlNode::children)
}

fn first_arg<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlValue> {
    doc.get(name)?
        .entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}
