use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static INVITE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:https?://)?(?:www\.)?(?:discord\.gg|discord(?:app)?\.com/invite)/(?-i)([A-Za-z0-9-]{2,32})\b",
    )
    .expect("invite link pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Listener use: every distinct code once, first-seen order.
    Passive,
    /// Check use: every occurrence in message order, so each posted link
    /// is scored.
    Exhaustive,
}

pub fn extract_codes<'a, I>(messages: I, mode: ExtractMode) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut codes = Vec::new();

    for content in messages {
        for captures in INVITE_LINK.captures_iter(content) {
            let code = &captures[1];
            if mode == ExtractMode::Passive && !seen.insert(code.to_string()) {
                continue;
            }
            codes.push(code.to_string());
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_link_shapes() {
        let text = "join discord.gg/abc123 or https://discord.com/invite/Sakura-Club \
                    and HTTP://www.DiscordApp.com/invite/XyZ9 but not discord.gg/x";
        assert_eq!(
            extract_codes([text], ExtractMode::Exhaustive),
            vec!["abc123", "Sakura-Club", "XyZ9"]
        );
    }

    #[test]
    fn ignores_other_hosts() {
        let text = "https://example.com/invite/abcdef notdiscord.gg/abc";
        assert!(extract_codes([text], ExtractMode::Exhaustive).is_empty());
    }

    #[test]
    fn passive_mode_deduplicates() {
        let messages = ["discord.gg/aaa discord.gg/bbb", "again discord.gg/aaa"];
        assert_eq!(extract_codes(messages, ExtractMode::Passive), vec!["aaa", "bbb"]);
        assert_eq!(
            extract_codes(messages, ExtractMode::Exhaustive),
            vec!["aaa", "bbb", "aaa"]
        );
    }
}
