use chrono::{DateTime, Utc};

use super::prompt::{format_timestamp, percent};
use crate::config::ReportLanguage;
use crate::gate::EligiblePrediction;

pub const FALLBACK_MODEL: &str = "deterministic-template-v1";

/// Template report built from the prediction alone. No I/O, so it cannot
/// fail, and identical inputs give identical text.
pub fn fallback_report(
    eligible: &EligiblePrediction,
    generated_at: DateTime<Utc>,
    language: ReportLanguage,
) -> String {
    let prediction = eligible.prediction();
    let label = &prediction.label;
    let confidence = percent(prediction.confidence);
    let date = format_timestamp(generated_at, language);

    match language {
        ReportLanguage::English => format!(
            "RADIOLOGICAL REPORT

PATIENT DATA:
- Date: {date}

STUDY TECHNIQUE:
Chest radiograph analysed by an automated image classifier.

RADIOLOGICAL FINDINGS:
The automated classifier labelled this study as {label} with {confidence} confidence. \
A detailed narrative description was not available for this study.

DIAGNOSTIC IMPRESSION:
Findings compatible with {label} (confidence: {confidence}).

CLINICAL RECOMMENDATIONS:
- Prompt medical evaluation recommended
- Consider treatment according to clinical judgement
- Radiological follow-up in 48-72 hours

ADDITIONAL NOTES:
Study interpreted with AI assistance. Requires physician validation.
"
        ),
        ReportLanguage::Spanish => format!(
            "INFORME RADIOLÓGICO

DATOS DEL PACIENTE:
- Fecha: {date}

TÉCNICA:
Radiografía de tórax analizada mediante un clasificador automático de imágenes.

HALLAZGOS RADIOLÓGICOS:
El clasificador automático etiquetó este estudio como {label} con una confianza de {confidence}. \
No se dispuso de una descripción narrativa detallada para este estudio.

IMPRESIÓN DIAGNÓSTICA:
Hallazgos compatibles con {label} (confianza: {confidence}).

RECOMENDACIONES CLÍNICAS:
- Evaluación médica pronta recomendada
- Considerar tratamiento según juicio clínico
- Seguimiento radiológico en 48-72 horas

NOTAS:
Estudio interpretado con asistencia de IA. Requiere validación médica.
"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::DecisionGate;
    use chrono::TimeZone;
    use cxr_shared::Prediction;
    use std::collections::BTreeMap;

    fn eligible(confidence: f32) -> EligiblePrediction {
        let prediction = Prediction {
            label: "Pneumonia".into(),
            confidence,
            scores: BTreeMap::from([
                ("Pneumonia".into(), confidence),
                ("Normal".into(), 1.0 - confidence),
            ]),
            saliency: None,
            engine: "cnn".into(),
        };
        DecisionGate::new(0.8, "Pneumonia").admit(&prediction).unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap()
    }

    #[test]
    fn names_label_and_confidence_in_plain_text() {
        let text = fallback_report(&eligible(0.92), at(), ReportLanguage::English);
        assert!(text.contains("Pneumonia"));
        assert!(text.contains("92.0%"));
        assert!(text.contains("01/02/2025 08:00 UTC"));
        assert!(text.contains("RADIOLOGICAL FINDINGS:"));
    }

    #[test]
    fn identical_inputs_give_identical_text() {
        let p = eligible(0.85);
        for language in [ReportLanguage::English, ReportLanguage::Spanish] {
            assert_eq!(
                fallback_report(&p, at(), language),
                fallback_report(&p, at(), language)
            );
        }
    }

    #[test]
    fn spanish_template_uses_spanish_headings() {
        let text = fallback_report(&eligible(0.9), at(), ReportLanguage::Spanish);
        assert!(text.contains("IMPRESIÓN DIAGNÓSTICA:"));
        assert!(text.contains("90.0%"));
    }
}
