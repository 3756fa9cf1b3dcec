use ferry_core::SystemLabel;
use regex::Regex;

/// Gmail labels derived from one IMAP folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMapping {
    pub custom_label: String,
    pub system_label: Option<SystemLabel>,
}

/// Map an IMAP folder name to its Gmail labels. Hierarchy separators are
/// normalized to `/`, empty path components are collapsed, and the system
/// label is decided by the leaf name alone (first match wins).
pub fn map_folder(prefix: &str, folder: &str, delimiter: Option<&str>) -> LabelMapping {
    let mut components = split_components(folder, delimiter);
    if components.is_empty() {
        components.push("folder".to_string());
    }

    let leaf = components.last().map(String::as_str).unwrap_or("");
    let system_label = system_label_for_leaf(leaf);

    if leaf.eq_ignore_ascii_case("INBOX") {
        let last = components.len() - 1;
        components[last] = "Inbox".to_string();
    }

    let path = sanitize(&components.join("/"));
    let custom_label = if prefix.is_empty() {
        path
    } else {
        format!("{prefix}/{path}")
    };

    LabelMapping {
        custom_label,
        system_label,
    }
}

fn split_components(folder: &str, delimiter: Option<&str>) -> Vec<String> {
    let mut normalized = folder.to_string();
    if let Some(delim) = delimiter {
        if !delim.is_empty() && delim != "/" {
            normalized = normalized.replace(delim, "/");
        }
    }

    normalized
        .split('/')
        .map(str::trim)
        .filter(|component| !component.is_empty())
        .map(str::to_string)
        .collect()
}

fn system_label_for_leaf(leaf: &str) -> Option<SystemLabel> {
    let lowered = leaf.trim().to_ascii_lowercase();
    if lowered == "inbox" {
        Some(SystemLabel::Inbox)
    } else if lowered.starts_with("sent") {
        Some(SystemLabel::Sent)
    } else if lowered.starts_with("trash") || lowered.starts_with("deleted") {
        Some(SystemLabel::Trash)
    } else if lowered.starts_with("spam") || lowered.starts_with("junk") {
        Some(SystemLabel::Spam)
    } else if lowered.starts_with("draft") {
        Some(SystemLabel::Draft)
    } else {
        None
    }
}

fn sanitize(path: &str) -> String {
    let pattern = Regex::new(r"[^\w./ -]+").expect("valid label sanitize regex");
    pattern.replace_all(path, "_").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_maps_to_system_inbox() {
        let mapping = map_folder("iCloud", "INBOX", Some("/"));
        assert_eq!(mapping.system_label, Some(SystemLabel::Inbox));
        assert_eq!(mapping.custom_label, "iCloud/Inbox");
    }

    #[test]
    fn sent_messages_maps_to_system_sent() {
        let mapping = map_folder("iCloud", "Sent Messages", Some("/"));
        assert_eq!(mapping.system_label, Some(SystemLabel::Sent));
        assert_eq!(mapping.custom_label, "iCloud/Sent Messages");
    }

    #[test]
    fn arbitrary_hierarchy_gets_no_system_label() {
        let mapping = map_folder("iCloud", "Projects/2024", Some("/"));
        assert_eq!(mapping.system_label, None);
        assert_eq!(mapping.custom_label, "iCloud/Projects/2024");
    }

    #[test]
    fn foreign_delimiter_is_normalized() {
        let mapping = map_folder("iCloud", "Archive.Old.Taxes", Some("."));
        assert_eq!(mapping.custom_label, "iCloud/Archive/Old/Taxes");
    }

    #[test]
    fn leaf_decides_the_system_label() {
        assert_eq!(
            map_folder("p", "Archive/Trash", Some("/")).system_label,
            Some(SystemLabel::Trash)
        );
        assert_eq!(
            map_folder("p", "Deleted Messages", Some("/")).system_label,
            Some(SystemLabel::Trash)
        );
        assert_eq!(
            map_folder("p", "Junk", Some("/")).system_label,
            Some(SystemLabel::Spam)
        );
        assert_eq!(
            map_folder("p", "Drafts", Some("/")).system_label,
            Some(SystemLabel::Draft)
        );
    }

    #[test]
    fn empty_components_are_collapsed() {
        let mapping = map_folder("iCloud", "  /A//B/ ", Some("/"));
        assert_eq!(mapping.custom_label, "iCloud/A/B");
    }
}
