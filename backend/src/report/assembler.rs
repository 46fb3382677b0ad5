use chrono::{DateTime, Utc};
use cxr_shared::{
    GeneratedReport, MEDICAL_DISCLAIMER, Provenance, QualityMetrics, ReportMetadata, ReportSections,
};
use regex::Regex;
use uuid::Uuid;

use crate::config::ReportLanguage;
use crate::gate::EligiblePrediction;

pub const MISSING_SECTION: &str = "Not stated in the generated report.";

const EXPECTED_WORDS: f32 = 200.0;

lazy_static::lazy_static! {
    // Markdown emphasis, quote markers, bullets and "3." / "3)" numbering.
    static ref HEADING_PREFIX: Regex = Regex::new(r"^[\s#*_>-]*(?:\d+\s*[.)-]\s*)?[\s*_]*").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Findings,
    Impression,
    Recommendations,
    /// Recognised heading whose content is not extracted; it only ends the
    /// previous section.
    Other,
}

const ANCHORS: &[(&str, Section)] = &[
    ("RADIOLOGICAL FINDINGS", Section::Findings),
    ("FINDINGS", Section::Findings),
    ("HALLAZGOS RADIOLÓGICOS", Section::Findings),
    ("HALLAZGOS", Section::Findings),
    ("DIAGNOSTIC IMPRESSION", Section::Impression),
    ("IMPRESSION", Section::Impression),
    ("IMPRESIÓN DIAGNÓSTICA", Section::Impression),
    ("IMPRESIÓN", Section::Impression),
    ("CLINICAL RECOMMENDATIONS", Section::Recommendations),
    ("RECOMMENDATIONS", Section::Recommendations),
    ("RECOMENDACIONES CLÍNICAS", Section::Recommendations),
    ("RECOMENDACIONES", Section::Recommendations),
    ("PATIENT DATA", Section::Other),
    ("STUDY TECHNIQUE", Section::Other),
    ("TECHNIQUE", Section::Other),
    ("ADDITIONAL NOTES", Section::Other),
    ("NOTES", Section::Other),
    ("DATOS DEL PACIENTE", Section::Other),
    ("TÉCNICA DE ESTUDIO", Section::Other),
    ("TÉCNICA", Section::Other),
    ("NOTAS ADICIONALES", Section::Other),
    ("NOTAS", Section::Other),
];

/// Text plus how it was obtained, ready to be assembled.
#[derive(Debug, Clone)]
pub struct Draft {
    pub text: String,
    pub provenance: Provenance,
    pub model: String,
    pub attempts: u32,
    pub generated_at: DateTime<Utc>,
    pub language: ReportLanguage,
}

fn is_bullet(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with('•')
        || ["- ", "* ", "-\t", "*\t"]
            .iter()
            .any(|marker| line.starts_with(*marker))
}

/// Returns the section a line opens and any content that follows its colon.
/// List items only count when they name one of the extracted sections.
fn heading(line: &str) -> Option<(Section, &str)> {
    let start = HEADING_PREFIX.find(line).map(|m| m.end()).unwrap_or(0);
    let rest = &line[start..];
    let (head, tail) = rest.split_once(':').unwrap_or((rest, ""));
    let head = head
        .trim()
        .trim_matches(|c: char| c == '*' || c == '_')
        .trim()
        .to_uppercase();

    ANCHORS
        .iter()
        .find(|(anchor, _)| *anchor == head)
        .filter(|(_, section)| *section != Section::Other || !is_bullet(line))
        .map(|(_, section)| (*section, tail.trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace())))
}

struct Extracted {
    sections: ReportSections,
    found: usize,
}

fn extract_sections(text: &str) -> Extracted {
    let mut buckets: [Vec<&str>; 3] = Default::default();
    let mut current = None;

    for line in text.lines() {
        if let Some((section, tail)) = heading(line) {
            current = Some(section);
            if let (Some(idx), false) = (slot(section), tail.is_empty()) {
                buckets[idx].push(tail);
            }
            continue;
        }
        if let Some(idx) = current.and_then(slot) {
            buckets[idx].push(line);
        }
    }

    let mut found = 0;
    let mut take = |lines: &Vec<&str>| {
        let body = lines.join("\n").trim().to_string();
        if body.is_empty() {
            MISSING_SECTION.to_string()
        } else {
            found += 1;
            body
        }
    };
    let sections = ReportSections {
        findings: take(&buckets[0]),
        impression: take(&buckets[1]),
        recommendations: take(&buckets[2]),
    };
    Extracted { sections, found }
}

fn slot(section: Section) -> Option<usize> {
    match section {
        Section::Findings => Some(0),
        Section::Impression => Some(1),
        Section::Recommendations => Some(2),
        Section::Other => None,
    }
}

fn quality(text: &str, found: usize) -> QualityMetrics {
    let word_count = text.split_whitespace().count();
    let completeness = (word_count as f32 / EXPECTED_WORDS).min(1.0);
    let structure = if found > 0 { 1.0 } else { 0.5 };
    let section_completeness = found as f32 / 3.0;
    QualityMetrics {
        word_count,
        completeness,
        structure,
        section_completeness,
        overall: 0.4 * completeness + 0.3 * structure + 0.3 * section_completeness,
    }
}

fn follow_up(confidence: f32, language: ReportLanguage) -> Vec<String> {
    let items: &[&str] = match (language, confidence > 0.8) {
        (ReportLanguage::English, true) => &[
            "Radiological control in 48-72 hours",
            "Immediate clinical evaluation",
            "Consider complete blood count and biomarkers",
        ],
        (ReportLanguage::English, false) => &[
            "Clinical correlation required",
            "Medical evaluation recommended",
            "Follow-up according to clinical course",
        ],
        (ReportLanguage::Spanish, true) => &[
            "Control radiológico en 48-72 horas",
            "Evaluación clínica inmediata",
            "Considerar hemograma y biomarcadores",
        ],
        (ReportLanguage::Spanish, false) => &[
            "Correlación clínica necesaria",
            "Evaluación médica recomendada",
            "Seguimiento según evolución clínica",
        ],
    };
    items.iter().map(|s| s.to_string()).collect()
}

/// Builds the final report. Missing sections get a placeholder; the raw
/// text is kept untouched as the narrative.
pub fn assemble(draft: Draft, eligible: &EligiblePrediction) -> GeneratedReport {
    let prediction = eligible.prediction();
    let Extracted { sections, found } = extract_sections(&draft.text);
    if found < 3 {
        log::debug!("Report has {}/3 recognisable sections", found);
    }

    GeneratedReport {
        report_id: Uuid::new_v4(),
        quality: quality(&draft.text, found),
        follow_up: follow_up(prediction.confidence, draft.language),
        sections,
        metadata: ReportMetadata {
            generated_at: draft.generated_at,
            model: draft.model,
            source_label: prediction.label.clone(),
            source_confidence: prediction.confidence,
            engine: prediction.engine.clone(),
            attempts: draft.attempts,
            language: draft.language.as_str().to_string(),
        },
        disclaimer: MEDICAL_DISCLAIMER.to_string(),
        provenance: draft.provenance,
        narrative: draft.text,
    }
}
