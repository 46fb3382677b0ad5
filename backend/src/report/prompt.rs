use chrono::{DateTime, Utc};
use cxr_shared::{PatientContext, Prediction};

use crate::config::ReportLanguage;

pub fn percent(confidence: f32) -> String {
    format!("{:.1}%", confidence * 100.0)
}

pub(crate) fn format_timestamp(at: DateTime<Utc>, language: ReportLanguage) -> String {
    match language {
        ReportLanguage::English => at.format("%m/%d/%Y %H:%M UTC").to_string(),
        ReportLanguage::Spanish => at.format("%d/%m/%Y %H:%M UTC").to_string(),
    }
}

/// Instruction for the remote model. Pure templating: the same inputs always
/// give the same prompt.
pub fn build_prompt(
    prediction: &Prediction,
    patient: &PatientContext,
    generated_at: DateTime<Utc>,
    language: ReportLanguage,
) -> String {
    let confidence = percent(prediction.confidence);
    let date = format_timestamp(generated_at, language);
    let patient_block = patient_block(patient, language);

    match language {
        ReportLanguage::English => format!(
            "As a specialist radiologist, generate a complete and professional medical report \
based on the following information:
{patient_block}
AI analysis results:
- Classification: {label}
- Confidence: {confidence}
- Study: chest radiograph

Please provide a structured medical report including:

1. PATIENT DATA
2. STUDY TECHNIQUE
3. RADIOLOGICAL FINDINGS
4. DIAGNOSTIC IMPRESSION
5. CLINICAL RECOMMENDATIONS
6. ADDITIONAL NOTES

Date: {date}

RADIOLOGICAL REPORT:",
            label = prediction.label,
        ),
        ReportLanguage::Spanish => format!(
            "Como médico radiólogo especialista, genera un informe médico completo y profesional \
basado en la siguiente información:
{patient_block}
Resultados del análisis por IA:
- Clasificación: {label}
- Confianza: {confidence}
- Estudio: radiografía de tórax

Por favor, proporciona un informe médico estructurado que incluya:

1. DATOS DEL PACIENTE
2. TÉCNICA DE ESTUDIO
3. HALLAZGOS RADIOLÓGICOS
4. IMPRESIÓN DIAGNÓSTICA
5. RECOMENDACIONES CLÍNICAS
6. NOTAS ADICIONALES

Fecha: {date}

INFORME RADIOLÓGICO:",
            label = prediction.label,
        ),
    }
}

fn patient_block(patient: &PatientContext, language: ReportLanguage) -> String {
    if patient == &PatientContext::default() {
        return String::new();
    }

    let (title, age_label, sex_label, symptoms_label, history_label, unknown) = match language {
        ReportLanguage::English => (
            "Patient information",
            "Age",
            "Sex",
            "Symptoms",
            "Clinical history",
            "Not specified",
        ),
        ReportLanguage::Spanish => (
            "Información del paciente",
            "Edad",
            "Sexo",
            "Síntomas",
            "Historia clínica",
            "No especificado",
        ),
    };
    let age = patient
        .age
        .map(|a| a.to_string())
        .unwrap_or_else(|| unknown.to_string());
    let sex = patient.sex.as_deref().unwrap_or(unknown);
    let symptoms = patient.symptoms.as_deref().unwrap_or(unknown);

    let mut block = format!(
        "\n{title}:\n- {age_label}: {age}\n- {sex_label}: {sex}\n- {symptoms_label}: {symptoms}\n"
    );
    if let Some(history) = patient.clinical_history.as_deref() {
        block.push_str(&format!("- {history_label}: {history}\n"));
    }
    block
}
