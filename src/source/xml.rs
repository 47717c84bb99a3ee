//! Namespace-agnostic lookups over a parsed XML tree.
//!
//! Market documents come with varying default namespaces and prefixes, so
//! every lookup matches on the local (unprefixed) tag name only.

use roxmltree::Node;

/// All element descendants of `node` (excluding `node` itself) whose local
/// tag name equals `local_name`, in document order.
pub fn descendants_named<'a, 'input>(
    node: Node<'a, 'input>,
    local_name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.descendants()
        .skip(1)
        .filter(move |n| n.is_element() && n.tag_name().name() == local_name)
}

/// First element reached by following `path` one local name at a time, each
/// step searching the descendants of the previous match.
pub fn find_path<'a, 'input>(node: Node<'a, 'input>, path: &[&'a str]) -> Option<Node<'a, 'input>> {
    path.iter()
        .try_fold(node, |current, &name| descendants_named(current, name).next())
}

/// Trimmed text of the element at `path`, if present and non-empty.
pub fn text_at<'a, 'input>(node: Node<'a, 'input>, path: &[&'a str]) -> Option<&'a str> {
    find_path(node, path)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
