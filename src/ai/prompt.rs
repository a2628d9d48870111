// src/ai/prompt.rs
//! System prompts and conversation windows for the assistant sessions.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;

use super::ChatTurn;
use crate::models::chat::Message;
use crate::models::profile::{DoctorProfile, PatientProfile};

/// Prefix of the substitute reply stored when the assistant could not answer.
pub const FALLBACK_MARKER: &str = "[assistant unavailable]";

lazy_static! {
    static ref MENTION: Regex =
        Regex::new(r"@([A-Za-z][A-Za-z'\-]*(?:[ _][A-Za-z][A-Za-z'\-]*)?)").expect("valid mention regex");
}

/// Raw `@name` tokens in order of appearance. Each token may carry one
/// trailing word that is not part of the name; resolution handles that.
pub fn extract_mentions(text: &str) -> Vec<String> {
    MENTION
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Resolves the first mention in `text` to one of the doctor's patients.
///
/// Matches the full name (space or underscore separated) before the first
/// name, case-insensitively.
pub fn resolve_mention<'a>(text: &str, patients: &'a [PatientProfile]) -> Option<&'a PatientProfile> {
    for token in extract_mentions(text) {
        let full = token.replace('_', " ").to_lowercase();
        if let Some(p) = patients.iter().find(|p| p.full_name.to_lowercase() == full) {
            return Some(p);
        }

        let first = full.split(' ').next().unwrap_or_default();
        let mut by_first = patients.iter().filter(|p| p.first_name().to_lowercase() == first);
        if let (Some(p), None) = (by_first.next(), by_first.next()) {
            return Some(p);
        }
    }
    None
}

fn push_field(out: &mut String, label: &str, value: Option<&str>) {
    if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
        out.push_str("- ");
        out.push_str(label);
        out.push_str(": ");
        out.push_str(v);
        out.push('\n');
    }
}

fn patient_facts(patient: &PatientProfile) -> String {
    let mut facts = String::new();
    push_field(&mut facts, "Name", Some(&patient.full_name));
    let age = patient.age_on(Utc::now().date_naive()).map(|a| a.to_string());
    push_field(&mut facts, "Age", age.as_deref());
    push_field(&mut facts, "Gender", patient.gender.as_deref());
    push_field(&mut facts, "Medical history", patient.medical_history.as_deref());
    push_field(&mut facts, "Allergies", patient.allergies.as_deref());
    push_field(&mut facts, "Current medications", patient.current_medications.as_deref());
    facts
}

pub fn doctor_system_prompt(doctor: &DoctorProfile, mentioned: Option<&PatientProfile>) -> String {
    let mut prompt = format!(
        "You are a clinical assistant supporting Dr. {} on the Doc+ telehealth platform. \
         Provide concise, evidence-based information to help with assessment, treatment planning \
         and documentation. Flag uncertainty explicitly, cite guideline names when relevant, and \
         remember that the treating physician makes every final clinical decision.",
        doctor.full_name
    );
    if let Some(spec) = doctor.specialization.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(&format!(" The physician's specialty is {}.", spec));
    }

    if let Some(patient) = mentioned {
        prompt.push_str("\n\nThe physician is asking about this patient:\n");
        prompt.push_str(&patient_facts(patient));
    }
    prompt
}

pub fn patient_system_prompt(patient: &PatientProfile) -> String {
    format!(
        "You are a compassionate mental health support companion on the Doc+ telehealth platform, \
         talking with {}. Listen actively, validate feelings, and offer grounding or coping \
         techniques in plain language.\n\n\
         You must never diagnose a condition and never give advice about starting, stopping or \
         changing medication. For questions about diagnosis or medication, encourage them to speak \
         with their doctor. If they mention self-harm or an emergency, urge them to contact local \
         emergency services immediately.\n\n\
         Background shared by the patient:\n{}",
        patient.first_name(),
        patient_facts(patient)
    )
}

/// Builds the turn list: system prompt, the trailing `window` prior messages
/// (substitute replies excluded), then the new user turn.
pub fn build_turns(system: String, history: &[Message], window: usize, new_text: &str) -> Vec<ChatTurn> {
    let prior: Vec<&Message> = history
        .iter()
        .filter(|m| !(m.is_ai_message && m.content.starts_with(FALLBACK_MARKER)))
        .collect();
    let start = prior.len().saturating_sub(window);

    let mut turns = Vec::with_capacity(prior.len() - start + 2);
    turns.push(ChatTurn::system(system));
    for message in &prior[start..] {
        if message.is_ai_message {
            turns.push(ChatTurn::assistant(message.content.clone()));
        } else {
            turns.push(ChatTurn::user(message.content.clone()));
        }
    }
    turns.push(ChatTurn::user(new_text));
    turns
}
