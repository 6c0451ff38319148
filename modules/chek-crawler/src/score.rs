//! Heuristic relevance scorer for regional complaint content.
//!
//! Pure lexicon/threshold scoring, deliberately simple and auditable: the
//! failure mode is a false negative on novel phrasing, never a crash. Counts
//! are over distinct lexicon words present (substring membership), not total
//! occurrences.

const GEO_WORDS: &[&str] = &[
    "潮汕", "汕头", "潮州", "揭阳", "南澳", "普宁", "潮阳", "潮南", "饶平", "澄海", "潮安", "榕城",
];

const COMPLAINT_WORDS: &[&str] = &[
    "投诉", "举报", "曝光", "维权", "被坑", "宰客", "欺诈", "黑店", "强制", "恶心", "报警",
    "12315", "工商", "市场监管",
];

const EVIDENCE_WORDS: &[&str] = &[
    "时间", "地点", "截图", "录音", "订单", "转账", "发票", "车牌", "店名", "定位", "金额", "元",
];

const SPAM_WORDS: &[&str] = &[
    "探店", "种草", "优惠", "团购", "买一送一", "私信", "加V", "vx", "微信号", "带货", "推广",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Complaint,
    GeoRelated,
    LikelySpam,
    HasEvidence,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Complaint => "complaint",
            Label::GeoRelated => "geo_related",
            Label::LikelySpam => "likely_spam",
            Label::HasEvidence => "has_evidence",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoreResult {
    /// Relevance in [0, 1].
    pub score: f64,
    pub labels: Vec<Label>,
}

impl ScoreResult {
    pub fn has_label(&self, label: Label) -> bool {
        self.labels.contains(&label)
    }
}

fn count_hits(text: &str, words: &[&str]) -> usize {
    words.iter().filter(|w| text.contains(*w)).count()
}

fn clip01(x: f64) -> f64 {
    if !x.is_finite() {
        return 0.0;
    }
    x.clamp(0.0, 1.0)
}

/// Score a candidate's raw text (pre-footer). Deterministic and
/// side-effect-free.
pub fn score(title: &str, body: &str) -> ScoreResult {
    let text = format!("{title}\n{body}");
    let len = text.chars().filter(|c| !c.is_whitespace()).count();

    let geo_hit = count_hits(&text, GEO_WORDS) > 0;
    let complaint_count = count_hits(&text, COMPLAINT_WORDS);
    let complaint_hit = complaint_count > 0;
    let evidence_count = count_hits(&text, EVIDENCE_WORDS);
    let spam_count = count_hits(&text, SPAM_WORDS);

    let mut score = 0.15;
    if geo_hit {
        score += 0.18;
    }
    if complaint_hit {
        score += 0.25;
    }
    score += (complaint_count as f64 * 0.06).min(0.25);
    score += (evidence_count as f64 * 0.04).min(0.20);

    // Length shaping: junk snippets score down, substantive posts score up.
    if len < 80 {
        score -= 0.25;
    } else if len < 160 {
        score -= 0.12;
    } else if len > 900 {
        score += 0.06;
    }

    score -= (spam_count as f64 * 0.08).min(0.35);

    let mut labels = Vec::new();
    if complaint_hit {
        labels.push(Label::Complaint);
    }
    if geo_hit {
        labels.push(Label::GeoRelated);
    }
    if spam_count >= 2 && !complaint_hit {
        labels.push(Label::LikelySpam);
    }
    if evidence_count >= 2 {
        labels.push(Label::HasEvidence);
    }

    ScoreResult {
        score: clip01(score),
        labels,
    }
}
