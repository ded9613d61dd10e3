//! Lexicon-based emotion estimate.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::shared::{Emotion, Intensity};

static LEXICON: Lazy<HashMap<&'static str, Emotion>> = Lazy::new(|| {
    let groups: [(Emotion, &[&str]); 5] = [
        (
            Emotion::Joy,
            &["happy", "glad", "great", "love", "excited", "wonderful", "thrilled", "delighted", "awesome", "grateful"],
        ),
        (
            Emotion::Sadness,
            &["sad", "depressed", "lonely", "miserable", "hopeless", "crying", "heartbroken", "grief", "unhappy", "empty"],
        ),
        (
            Emotion::Anger,
            &["angry", "furious", "hate", "mad", "annoyed", "outraged", "livid", "frustrated", "pissed"],
        ),
        (
            Emotion::Fear,
            &["afraid", "scared", "terrified", "frightened", "panic", "fear", "threatened"],
        ),
        (
            Emotion::Anxiety,
            &["anxious", "worried", "nervous", "stressed", "overwhelmed", "uneasy", "tense"],
        ),
    ];
    groups
        .iter()
        .flat_map(|(emotion, words)| words.iter().map(move |w| (*w, *emotion)))
        .collect()
});

const INTENSIFIERS: &[&str] = &["very", "so", "extremely", "really", "totally", "completely", "incredibly"];

/// Tie-break order when two emotions have the same number of hits.
const PRIORITY: [Emotion; 5] = [Emotion::Sadness, Emotion::Fear, Emotion::Anger, Emotion::Anxiety, Emotion::Joy];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmotionReading {
    pub emotion: Emotion,
    pub intensity: Intensity,
}

pub fn read_emotion(text: &str) -> EmotionReading {
    let mut hits: HashMap<Emotion, u32> = HashMap::new();
    let mut intensifiers = 0u32;
    let mut shouted = 0u32;

    for word in text.split(|c: char| !c.is_alphabetic()).filter(|w| !w.is_empty()) {
        let lower = word.to_lowercase();
        if let Some(emotion) = LEXICON.get(lower.as_str()) {
            *hits.entry(*emotion).or_default() += 1;
        } else if INTENSIFIERS.contains(&lower.as_str()) {
            intensifiers += 1;
        }
        if word.chars().count() >= 3 && word.chars().all(|c| c.is_uppercase()) {
            shouted += 1;
        }
    }

    let best = PRIORITY
        .iter()
        .filter_map(|e| hits.get(e).map(|n| (*e, *n)))
        .fold(None, |acc: Option<(Emotion, u32)>, (e, n)| match acc {
            Some((_, best)) if best >= n => acc,
            _ => Some((e, n)),
        });

    let Some((emotion, count)) = best else {
        return EmotionReading { emotion: Emotion::Neutral, intensity: Intensity::Low };
    };

    let exclamations = text.matches('!').count().min(3) as u32;
    let score = count * 2 + intensifiers + exclamations + shouted.min(3);
    let intensity = if score >= 6 {
        Intensity::High
    } else if score >= 3 {
        Intensity::Medium
    } else {
        Intensity::Low
    };
    EmotionReading { emotion, intensity }
}
