//! キーワードパターンによるタグ分類

use regex::Regex;
use std::collections::BTreeSet;

use crate::models::TagKind;

/// チャット本文をタグに分類する
pub struct TagClassifier {
    patterns: Vec<(TagKind, Regex)>,
}

impl TagClassifier {
    pub fn new() -> Self {
        // 韓国語チャット向けのパターン
        let sources = [
            (
                TagKind::Laugh,
                r"ㅋ{2,}|ㅎ{2,}|하하|ㅏㅏ|캬|푸하|풉|웃겨|개웃|존웃|lol|lmao",
            ),
            (
                TagKind::Excitement,
                r"!{2,}|\?{2,}|ㄷㄷ|헐|대박|와|오|우와|미친|개쩔|쩐다|ㄱㄱ|고고|가즈아",
            ),
            (
                TagKind::Surprise,
                r"헉|뭣|뭐야|어떻게|진짜|실화|레전드|띠용|충격|놀람",
            ),
            (TagKind::Reaction, r"ㅠㅠ|ㅜㅜ|아니|안돼|제발|부탁|응원"),
            (
                TagKind::Greeting,
                r"안녕|ㅎㅇ|하이|반가|어서오|ㅂㅇ|\bhi\b|hello",
            ),
        ];

        let patterns = sources
            .into_iter()
            .filter_map(|(tag, source)| match Regex::new(source) {
                Ok(regex) => Some((tag, regex)),
                Err(e) => {
                    tracing::error!("❌ [TAGS] invalid pattern for {}: {}", tag, e);
                    None
                }
            })
            .collect();

        Self { patterns }
    }

    /// 本文に含まれるタグの集合を返す
    pub fn classify(&self, text: &str) -> BTreeSet<TagKind> {
        let lowered = text.to_lowercase();
        self.patterns
            .iter()
            .filter(|(_, regex)| regex.is_match(&lowered))
            .map(|(tag, _)| *tag)
            .collect()
    }
}

impl Default for TagClassifier {
    fn default() -> Self {
        Self::new()
    }
}
