use crate::models::DEFAULT_SUBJECT;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

const MAX_KEYWORDS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Factual,
    Problem,
    Conceptual,
    Procedural,
    Verification,
}

impl QuestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Factual => "factual",
            Self::Problem => "problem",
            Self::Conceptual => "conceptual",
            Self::Procedural => "procedural",
            Self::Verification => "verification",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Explanation,
    Solution,
    Example,
    StepByStep,
    GeneralHelp,
}

/// Per-request classification of a question. Never persisted.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionAnalysis {
    pub text: String,
    pub question_type: QuestionType,
    pub difficulty: Difficulty,
    pub subject: Option<String>,
    pub keywords: Vec<String>,
    pub intent: Intent,
    pub requires_calculation: bool,
    pub requires_visual: bool,
}

/// What is known about the asker when classifying.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub subjects: Vec<String>,
}

pub trait QuestionClassifier: Send + Sync {
    fn analyze(&self, question: &str, context: &UserContext) -> QuestionAnalysis;
}

const TYPE_PATTERNS: [(QuestionType, &[&str]); 5] = [
    (
        QuestionType::Factual,
        &[r"\bwhat is\b", r"\bdefine\b", r"\bdefinition\b", r"\bwho is\b", r"\bwhen did\b"],
    ),
    (
        QuestionType::Problem,
        &[r"\bsolve\b", r"\bcalculate\b", r"\bfind\b", r"\bcompute\b", r"\bequation\b"],
    ),
    (
        QuestionType::Conceptual,
        &[r"\bexplain\b", r"\bwhy\b", r"\bhow does\b", r"\brelationship\b", r"\bdifference\b"],
    ),
    (
        QuestionType::Procedural,
        &[r"\bhow to\b", r"\bhow do i\b", r"\bsteps\b", r"\bprocedure\b", r"\bmethod\b"],
    ),
    (
        QuestionType::Verification,
        &[r"\bis this correct\b", r"\bcheck\b", r"\bverify\b", r"\bvalidate\b"],
    ),
];

const SUBJECT_KEYWORDS: [(&str, &[&str]); 5] = [
    (
        "mathematics",
        &["math", "calculus", "algebra", "geometry", "trigonometry", "statistics"],
    ),
    (
        "physics",
        &["force", "energy", "motion", "wave", "particle", "quantum"],
    ),
    (
        "chemistry",
        &["molecule", "atom", "reaction", "compound", "element"],
    ),
    (
        "biology",
        &["cell", "organism", "genetics", "evolution", "ecosystem"],
    ),
    (
        "computer_science",
        &["algorithm", "programming", "data structure", "software"],
    ),
];

const STOP_WORDS: [&str; 12] = [
    "what", "is", "the", "a", "an", "and", "or", "but", "how", "why", "when", "where",
];

const ADVANCED_INDICATORS: [&str; 6] = [
    "derive",
    "prove",
    "theorem",
    "lemma",
    "corollary",
    "complex",
];
const BEGINNER_INDICATORS: [&str; 5] = ["basic", "simple", "introduction", "what is", "define"];
const CALCULATION_WORDS: [&str; 4] = ["solve", "calculate", "compute", "find"];
const VISUAL_WORDS: [&str; 7] = [
    "graph",
    "diagram",
    "chart",
    "plot",
    "visualize",
    "draw",
    "geometry",
];

/// Regex and keyword-table heuristics. The first matching type pattern wins;
/// questions matching none are treated as conceptual.
pub struct KeywordClassifier {
    type_patterns: Vec<(QuestionType, Vec<Regex>)>,
    word: Regex,
    arithmetic: Regex,
}

impl KeywordClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        let type_patterns = TYPE_PATTERNS
            .iter()
            .map(|(question_type, patterns)| -> Result<_, regex::Error> {
                let compiled = patterns
                    .iter()
                    .map(|pattern| Regex::new(pattern))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((*question_type, compiled))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            type_patterns,
            word: Regex::new(r"\b[a-zA-Z]{3,}\b")?,
            // An operator between operands, so hyphenated words do not count.
            arithmetic: Regex::new(r"[0-9a-z)]\s*[=+*/^-]\s*[0-9(]|=")?,
        })
    }

    fn question_type(&self, text: &str) -> QuestionType {
        self.type_patterns
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|pattern| pattern.is_match(text)))
            .map(|(question_type, _)| *question_type)
            .unwrap_or(QuestionType::Conceptual)
    }

    fn keywords(&self, text: &str) -> Vec<String> {
        self.word
            .find_iter(text)
            .map(|found| found.as_str())
            .filter(|word| !STOP_WORDS.contains(word))
            .take(MAX_KEYWORDS)
            .map(str::to_string)
            .collect()
    }
}

fn detect_subject(text: &str, context: &UserContext) -> Option<String> {
    let from_table = SUBJECT_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| text.contains(keyword)))
        .map(|(subject, _)| subject.to_string());

    from_table.or_else(|| {
        context
            .subjects
            .iter()
            .filter(|subject| !subject.eq_ignore_ascii_case(DEFAULT_SUBJECT))
            .find(|subject| {
                let lowered = subject.trim().to_lowercase();
                !lowered.is_empty() && text.contains(&lowered)
            })
            .cloned()
    })
}

fn difficulty(text: &str) -> Difficulty {
    if ADVANCED_INDICATORS.iter().any(|word| text.contains(word)) {
        Difficulty::Advanced
    } else if BEGINNER_INDICATORS.iter().any(|word| text.contains(word)) {
        Difficulty::Beginner
    } else {
        Difficulty::Intermediate
    }
}

fn intent(text: &str) -> Intent {
    let any = |words: &[&str]| words.iter().any(|word| text.contains(word));

    if any(&["explain", "understand", "concept"]) {
        Intent::Explanation
    } else if any(&["solve", "calculate", "find"]) {
        Intent::Solution
    } else if any(&["example", "show me"]) {
        Intent::Example
    } else if any(&["step", "how to", "procedure"]) {
        Intent::StepByStep
    } else {
        Intent::GeneralHelp
    }
}

impl QuestionClassifier for KeywordClassifier {
    fn analyze(&self, question: &str, context: &UserContext) -> QuestionAnalysis {
        let text = question.trim().to_lowercase();

        QuestionAnalysis {
            question_type: self.question_type(&text),
            difficulty: difficulty(&text),
            subject: detect_subject(&text, context),
            keywords: self.keywords(&text),
            intent: intent(&text),
            requires_calculation: CALCULATION_WORDS.iter().any(|word| text.contains(word))
                || self.arithmetic.is_match(&text),
            requires_visual: VISUAL_WORDS.iter().any(|word| text.contains(word)),
            text: question.trim().to_string(),
        }
    }
}
