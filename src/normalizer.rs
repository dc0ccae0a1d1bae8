//! Deterministic spacing repair for scraped location and purpose strings.
//!
//! The scraper glues table cells together ("BEACHRIVERSIDE ESPYANCHEP WA 6035"). The rules
//! here only ever insert spaces or swap a known-bad fragment for its correction, and they are
//! re-applied until the text stops changing, so `normalize(normalize(s)) == normalize(s)`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

const MAX_PASSES: usize = 8;

static ADDRESS_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"([A-Z])(BEACH|RIVER|PARK|OVAL|GROUND|QUAY|STAGE|INLET|ESPLANADE|FORESHORE|DRIVE|STREET|CREST|MOTORPLEX)",
    )
    .expect("valid address keyword regex")
});
static PURPOSE_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Z])(CLUB|CHRISTMAS|CAROLS|FIREWORKS|FESTIVE|PARTY|LIGHTS|SPIRIT|PROXIMITY)")
        .expect("valid purpose keyword regex")
});
// street-type abbreviation glued to the suburb that precedes the state
static ABBREVIATION_GLUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z]{3,}) (PDE|PD|DR|ST|RD|TCE|AVE|HWY|ESP|CRES|PL)([A-Z]{3,}) (WA)\b")
        .expect("valid abbreviation regex")
});
static STATE_AFTER_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Z]{3,})WA ?(\d{4})\b").expect("valid state regex"));
static STATE_AFTER_DIGIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d)(WA)\b").expect("valid state digit regex"));
static POSTCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Z])(\d{4})\b").expect("valid postcode regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

static ADDRESS_NEEDS_FIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Z]{2,}(BEACH|RIVER|PARK|DRIVE|DR|ST|RD|WA|QUAY|OVAL)")
        .expect("valid address heuristic regex")
});
static PURPOSE_NEEDS_FIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Z]{2,}(BEACH|CLUB|CHRISTMAS|CAROLS|FIREWORKS|PARTY|LIGHTS|SPIRIT|PROXIMITY)")
        .expect("valid purpose heuristic regex")
});

/// Fragments seen in the published schedule, applied after keyword splitting.
const KNOWN_FIXES: &[(&str, &str)] = &[
    ("RIVERSIDE DRPERTH", "RIVERSIDE DRIVE PERTH"),
    ("DRIVEPERTH", "DRIVE PERTH"),
    ("GROUNDNELSON", "GROUND NELSON"),
    ("NELSON CREAST", "NELSON CRESCENT"),
    ("PDEELLENBROOK", "PDE ELLENBROOK"),
    ("BELGRAVIA STCLOVERDALE", "BELGRAVIA ST CLOVERDALE"),
    ("FORESHORETHE", "FORESHORE THE"),
    ("PARKSAIL", "PARK SAIL"),
    ("SOMERSET STPINGELLY", "SOMERSET ST PINGELLY"),
    ("ANKETELL RDKWINANA", "ANKETELL RD KWINANA"),
    ("SERPENTINE RDKAMBALDA", "SERPENTINE RD KAMBALDA"),
    ("INLETTHE", "INLET THE"),
    ("ESPLANADEPERTH", "ESPLANADE PERTH"),
];

/// Words that legitimately start with a street-type abbreviation.
const ABBREVIATION_WORDS: &[&str] = &[
    "STREET",
    "STIRLING",
    "DRIVE",
    "PARADE",
    "TERRACE",
    "AVENUE",
    "HIGHWAY",
    "ESPLANADE",
    "ESPERANCE",
    "CRESCENT",
    "PLACE",
    "PLAZA",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextKind {
    Address,
    Purpose,
}

impl TextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextKind::Address => "address",
            TextKind::Purpose => "purpose",
        }
    }

    pub fn normalize(&self, text: &str) -> String {
        match self {
            TextKind::Address => normalize(text),
            TextKind::Purpose => normalize_purpose(text),
        }
    }

    pub fn needs_fixing(&self, text: &str) -> bool {
        needs_fixing(text, *self)
    }
}

/// Repairs the spacing of a scraped address. Pure and idempotent.
pub fn normalize(text: &str) -> String {
    to_fixpoint(text, address_pass)
}

/// Repairs the spacing of a scraped event purpose. Pure and idempotent.
pub fn normalize_purpose(text: &str) -> String {
    to_fixpoint(text, purpose_pass)
}

/// True when the text still looks like concatenated uppercase words.
pub fn needs_fixing(text: &str, kind: TextKind) -> bool {
    match kind {
        TextKind::Address => ADDRESS_NEEDS_FIX_RE.is_match(text),
        TextKind::Purpose => PURPOSE_NEEDS_FIX_RE.is_match(text),
    }
}

fn to_fixpoint(text: &str, pass: fn(&str) -> String) -> String {
    let mut current = pass(text);
    for _ in 1..MAX_PASSES {
        let next = pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn address_pass(text: &str) -> String {
    let mut out = ADDRESS_KEYWORD_RE.replace_all(text, "${1} ${2}").into_owned();
    for (broken, fixed) in KNOWN_FIXES {
        if out.contains(broken) {
            out = out.replace(broken, fixed);
        }
    }
    out = ABBREVIATION_GLUE_RE
        .replace_all(&out, |caps: &Captures| split_abbreviation(caps))
        .into_owned();
    out = STATE_AFTER_WORD_RE
        .replace_all(&out, "${1} WA ${2}")
        .into_owned();
    out = STATE_AFTER_DIGIT_RE
        .replace_all(&out, "${1} ${2}")
        .into_owned();
    out = POSTCODE_RE.replace_all(&out, "${1} ${2}").into_owned();
    collapse_whitespace(&out)
}

fn purpose_pass(text: &str) -> String {
    let out = PURPOSE_KEYWORD_RE.replace_all(text, "${1} ${2}");
    collapse_whitespace(&out)
}

fn split_abbreviation(caps: &Captures<'_>) -> String {
    let joined = format!("{}{}", &caps[2], &caps[3]);
    if ABBREVIATION_WORDS.iter().any(|word| joined.starts_with(word)) {
        return caps[0].to_string();
    }
    format!("{} {} {} {}", &caps[1], &caps[2], &caps[3], &caps[4])
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRAPED: &[&str] = &[
        "CAPRICORN BEACHRIVERSIDE ESPYANCHEP WA 6035",
        "WACA GROUNDNELSON CREAST PERTH WA 6004",
        "SWAN RIVER – BARGERIVERSIDE DRPERTH WA 6000",
        "ELIZABETH QUAY -FLOATING STAGE IN THE INLETTHE ESPLANADEPERTH WA 6000",
        "ELLENBROOK CENTRAL PARKTHE PROMENADE PDEELLENBROOK WA 6069",
        "BELGRAVIA STCLOVERDALE WA 6105",
        "KWINANA MOTORPLEX ANKETELL RDKWINANA WA 6167",
        "PERTHWA6000",
        "XRIVERPARKBEACH",
        "  lots   of\tspace  ",
        "",
    ];

    #[test]
    fn separates_state_and_postcode_in_scenario_address() {
        let normalized = normalize("CAPRICORN BEACHRIVERSIDE ESPYANCHEP WA 6035");
        assert_eq!(normalized, "CAPRICORN BEACH RIVERSIDE ESP YANCHEP WA 6035");
        assert!(normalized.split(' ').any(|token| token == "WA"));
        assert!(normalized.ends_with("WA 6035"));
    }

    #[test]
    fn applies_known_fixes_after_keyword_split() {
        assert_eq!(
            normalize("WACA GROUNDNELSON CREAST PERTH WA 6004"),
            "WACA GROUND NELSON CRESCENT PERTH WA 6004"
        );
        assert_eq!(
            normalize("SWAN RIVER – BARGERIVERSIDE DRPERTH WA 6000"),
            "SWAN RIVER – BARGE RIVERSIDE DRIVE PERTH WA 6000"
        );
        assert_eq!(
            normalize("BELGRAVIA STCLOVERDALE WA 6105"),
            "BELGRAVIA ST CLOVERDALE WA 6105"
        );
    }

    #[test]
    fn inserts_space_before_state_and_postcode() {
        assert_eq!(normalize("PERTHWA6000"), "PERTH WA 6000");
        assert_eq!(normalize("YANCHEP6035"), "YANCHEP 6035");
        assert_eq!(normalize("6000WA"), "6000 WA");
    }

    #[test]
    fn keeps_words_that_start_with_abbreviations() {
        assert_eq!(
            normalize("CIVIC CENTRE STIRLING WA 6021"),
            "CIVIC CENTRE STIRLING WA 6021"
        );
        assert_eq!(
            normalize("CHIPPENDALE STREET WA 6000"),
            "CHIPPENDALE STREET WA 6000"
        );
    }

    #[test]
    fn splits_keyword_runs_needing_several_passes() {
        assert_eq!(normalize("XRIVERPARKBEACH"), "X RIVER PARK BEACH");
    }

    #[test]
    fn normalization_is_idempotent() {
        for sample in SCRAPED {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "address not idempotent: {sample}");
            let purpose = normalize_purpose(sample);
            assert_eq!(
                normalize_purpose(&purpose),
                purpose,
                "purpose not idempotent: {sample}"
            );
        }
    }

    #[test]
    fn clean_text_is_left_alone() {
        let clean = "Capricorn Beach, Riverside Esplanade, Yanchep WA 6035";
        assert_eq!(normalize(clean), clean);
        assert_eq!(normalize("  spaced   out  "), "spaced out");
    }

    #[test]
    fn repairs_purpose_text() {
        assert_eq!(
            normalize_purpose("CITY OF PERTHFESTIVE LIGHTS"),
            "CITY OF PERTH FESTIVE LIGHTS"
        );
        assert_eq!(
            normalize_purpose("YANCHEP SURFCLUB CHRISTMASPARTY"),
            "YANCHEP SURF CLUB CHRISTMAS PARTY"
        );
    }

    #[test]
    fn detects_text_needing_ai_fix() {
        assert!(needs_fixing(
            "CAPRICORN BEACHRIVERSIDE ESPYANCHEP WA 6035",
            TextKind::Address
        ));
        assert!(!needs_fixing(
            "Capricorn Beach, Riverside Esplanade, Yanchep WA 6035",
            TextKind::Address
        ));
        assert!(TextKind::Purpose.needs_fixing("SURFCLUB CHRISTMASPARTY"));
        assert!(!TextKind::Purpose.needs_fixing("Fireworks display"));
    }
}
