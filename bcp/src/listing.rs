//! Text rendering of a listed container.

use common::tree::{ContainerId, Tree};

/// Child containers first, then blobs, each level indented by two spaces.
#[must_use]
pub fn render(tree: &Tree, id: ContainerId, delimiter: char) -> String {
    let mut out = String::new();
    render_into(tree, id, delimiter, 0, &mut out);
    out
}

fn render_into(tree: &Tree, id: ContainerId, delimiter: char, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for child in tree[id].children() {
        out.push_str(&format!("{indent}{}{delimiter}\n", tree[*child].name));
        render_into(tree, *child, delimiter, depth + 1, out);
    }
    for blob in tree[id].blobs() {
        match blob.size {
            Some(size) => out.push_str(&format!(
                "{indent}{} ({})\n",
                blob.name,
                bytesize::ByteSize(size)
            )),
            None => out.push_str(&format!("{indent}{}\n", blob.name)),
        }
    }
}
