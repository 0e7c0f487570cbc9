//! Context reconstruction after the host compacts its own conversation.
//!
//! Emits one self-describing text block: a vocabulary preamble, every
//! top-level summary with its stable id and covered range, and the
//! retrieval verbs. The wire format is stable; the host prepends the block
//! verbatim.

use crate::store::Store;

/// Build the reconstruction block, or an empty string when there is
/// nothing to inject. Reads only summary rows.
pub fn build_injection(store: &Store, session_id: &str) -> anyhow::Result<String> {
    let summaries = store.summaries.top_level(session_id)?;
    if summaries.is_empty() {
        return Ok(String::new());
    }

    let mut out = String::from("<lcm-context>\n");
    out.push_str("Prior conversation summarized below. Use expand/S<id> to retrieve details.\n");
    for summary in &summaries {
        out.push_str(&format!(
            "[S{}  msgs {}\u{2013}{}]    {}\n",
            summary.id, summary.offset_start, summary.offset_end, summary.content
        ));
    }
    out.push_str("Verbs: expand S<id>, grep \"\u{2026}\", describe <id>\n");
    out.push_str("</lcm-context>");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::SummaryKind;

    #[test]
    fn empty_session_injects_nothing() {
        let store = Store::in_memory().unwrap();
        assert_eq!(build_injection(&store, "s1").unwrap(), "");
    }

    #[test]
    fn block_lists_top_level_summaries_in_order() {
        let store = Store::in_memory().unwrap();
        for i in 1..=4 {
            store
                .messages
                .append("s1", "user", &format!("msg {i}"), i)
                .unwrap();
        }
        let msgs = store.messages.by_offset_range("s1", 1, 4).unwrap();
        let a = store
            .summaries
            .create_leaf("s1", "first half", SummaryKind::PreserveDetails, &msgs[..2])
            .unwrap();
        let b = store
            .summaries
            .create_leaf("s1", "second half", SummaryKind::BulletPoints, &msgs[2..])
            .unwrap();

        let block = build_injection(&store, "s1").unwrap();
        assert!(block.starts_with("<lcm-context>"));
        assert!(block.ends_with("</lcm-context>"));
        assert!(block.contains(&format!("[S{}  msgs 1\u{2013}2]    first half", a.id)));
        assert!(block.contains(&format!("[S{}  msgs 3\u{2013}4]    second half", b.id)));
        assert!(block.contains("Verbs: expand S<id>"));

        // Insertion order: S(a) appears before S(b).
        let pos_a = block.find(&format!("[S{}", a.id)).unwrap();
        let pos_b = block.find(&format!("[S{}", b.id)).unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn condensed_children_are_not_listed() {
        let store = Store::in_memory().unwrap();
        for i in 1..=10 {
            store
                .messages
                .append("s1", "user", &format!("msg {i}"), i)
                .unwrap();
        }
        let msgs = store.messages.by_offset_range("s1", 1, 10).unwrap();
        let mut leaves = Vec::new();
        for chunk in msgs.chunks(2) {
            leaves.push(
                store
                    .summaries
                    .create_leaf("s1", "leaf text", SummaryKind::PreserveDetails, chunk)
                    .unwrap(),
            );
        }
        let parent = store
            .summaries
            .create_condensed("s1", "the condensed view", SummaryKind::BulletPoints, &leaves)
            .unwrap();

        let block = build_injection(&store, "s1").unwrap();
        assert!(block.contains(&format!("[S{}  msgs 1\u{2013}10]", parent.id)));
        for leaf in &leaves {
            assert!(!block.contains(&format!("[S{} ", leaf.id)));
        }
    }
}
