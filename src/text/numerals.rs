//! Number Recognition
//!
//! Reads counts and item indices written as Arabic digits (ASCII or
//! full-width), Chinese numerals or English number words.
//!
//! Used to find how many items an instruction asks for ("生成30章",
//! "generate 30 chapters", "up to chapter twenty") and which item a
//! generated title refers to ("第十二章", "Chapter 12", "12. ...").

use once_cell::sync::Lazy;
use regex::Regex;

const CN_CHARS: &str = "零〇一二两三四五六七八九十百千万";

const CN_NUM: &str = "[零〇一二两三四五六七八九十百千万]+";

// Teens and tens precede the single digits they start with.
const EN_WORD: &str = "eleven|twelve|thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|\
twenty|thirty|forty|fifty|sixty|seventy|eighty|ninety|\
zero|one|two|three|four|five|six|seven|eight|nine|ten|hundred|thousand";

const CN_COUNTER: &str = "[章节个条篇集回幕]";

static EN_NUM: Lazy<String> =
    Lazy::new(|| format!(r"\b(?:{w})\b(?:[\s-]+(?:and[\s-]+)?(?:{w})\b)*", w = EN_WORD));

static NUM: Lazy<String> = Lazy::new(|| format!(r"(\d+|{}|{})", CN_NUM, *EN_NUM));

/// Patterns that state the end of a range, in priority order.
static TARGET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let num = NUM.as_str();
    [
        format!(
            r"(?i)\b(?:up\s+to|to|through|until|till)\s+(?:(?:chapter|item|episode|part|scene|no\.)\s*)?#?\s*{}",
            num
        ),
        format!(r"(?:到|至)\s*第?\s*{}", num),
        format!(
            r"(?i)\b(?:generate|write|create|produce|list|draft|outline)\s+(?:the\s+(?:first|next)\s+)?{}\s+\p{{L}}",
            num
        ),
        format!(r"(?:生成|写|创作|列出|输出|续写)\s*{}\s*{}", num, CN_COUNTER),
        format!(
            r"(?i){}\s+(?:chapters?|items?|entries|entry|episodes?|scenes?|characters?|sections?|parts?)\b",
            num
        ),
        format!(r"{}\s*{}", num, CN_COUNTER),
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid numeral pattern"))
    .collect()
});

/// Patterns that read the index a title starts with.
static INDEX_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        format!(r"^\s*第\s*(\d+|{})\s*[章节回集部卷篇幕]", CN_NUM),
        format!(
            r"(?i)^\s*(?:chapter|ch\.|episode|part|item|scene)\s*#?\s*(\d+|{})",
            *EN_NUM
        ),
        r"^\s*#?(\d+)(?:\s*[.、:：)\]]|\s|$)".to_string(),
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid numeral pattern"))
    .collect()
});

/// Parses a number written in any supported form.
///
/// # Example
///
/// ```
/// use novelflow::text::numerals::parse_numeral;
///
/// assert_eq!(parse_numeral("30"), Some(30));
/// assert_eq!(parse_numeral("三十"), Some(30));
/// assert_eq!(parse_numeral("twenty-one"), Some(21));
/// ```
pub fn parse_numeral(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if text
        .chars()
        .all(|c| c.is_ascii_digit() || ('０'..='９').contains(&c))
    {
        return parse_digits(text);
    }
    if text.chars().all(|c| CN_CHARS.contains(c)) {
        return parse_chinese(text);
    }
    parse_english(text)
}

/// Finds the end index an instruction asks for.
///
/// Explicit ranges ("to N") win over counts ("generate N chapters"),
/// which win over bare counts ("N chapters").
pub fn target_end_index(instruction: &str) -> Option<u32> {
    TARGET_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures_iter(instruction)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| parse_numeral(m.as_str()))
            .find(|n| *n > 0)
    })
}

/// Reads the index a generated title starts with.
pub fn leading_index(title: &str) -> Option<u32> {
    INDEX_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(title)
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_numeral(m.as_str()))
    })
}

fn parse_digits(text: &str) -> Option<u32> {
    let ascii: Option<String> = text
        .chars()
        .map(|c| match c {
            '0'..='9' => Some(c),
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32),
            _ => None,
        })
        .collect();
    ascii?.parse().ok()
}

fn parse_chinese(text: &str) -> Option<u32> {
    let mut total: u32 = 0;
    let mut section: u32 = 0;
    let mut number: u32 = 0;

    for c in text.chars() {
        match c {
            '零' | '〇' => number = 0,
            '一' => number = 1,
            '二' | '两' => number = 2,
            '三' => number = 3,
            '四' => number = 4,
            '五' => number = 5,
            '六' => number = 6,
            '七' => number = 7,
            '八' => number = 8,
            '九' => number = 9,
            '十' | '百' | '千' => {
                let unit = match c {
                    '十' => 10,
                    '百' => 100,
                    _ => 1000,
                };
                // "十二" omits the leading one
                let multiplier = if number == 0 { 1 } else { number };
                section = section.checked_add(multiplier.checked_mul(unit)?)?;
                number = 0;
            }
            '万' => {
                let value = section.checked_add(number)?;
                total = total.checked_add(value.checked_mul(10_000)?)?;
                section = 0;
                number = 0;
            }
            _ => return None,
        }
    }

    total.checked_add(section)?.checked_add(number)
}

fn parse_english(text: &str) -> Option<u32> {
    let mut total: u32 = 0;
    let mut current: u32 = 0;
    let mut seen = false;

    for word in text
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        let value = match word.as_str() {
            "and" => continue,
            "zero" => 0,
            "one" => 1,
            "two" => 2,
            "three" => 3,
            "four" => 4,
            "five" => 5,
            "six" => 6,
            "seven" => 7,
            "eight" => 8,
            "nine" => 9,
            "ten" => 10,
            "eleven" => 11,
            "twelve" => 12,
            "thirteen" => 13,
            "fourteen" => 14,
            "fifteen" => 15,
            "sixteen" => 16,
            "seventeen" => 17,
            "eighteen" => 18,
            "nineteen" => 19,
            "twenty" => 20,
            "thirty" => 30,
            "forty" => 40,
            "fifty" => 50,
            "sixty" => 60,
            "seventy" => 70,
            "eighty" => 80,
            "ninety" => 90,
            "hundred" => {
                current = current.max(1).checked_mul(100)?;
                seen = true;
                continue;
            }
            "thousand" => {
                total = total.checked_add(current.max(1).checked_mul(1000)?)?;
                current = 0;
                seen = true;
                continue;
            }
            _ => return None,
        };
        current = current.checked_add(value)?;
        seen = true;
    }

    if seen {
        total.checked_add(current)
    } else {
        None
    }
}
