/// Instructions sent with the media on the analysis call. The JSON shape must
/// stay in sync with `models::analysis::ContentAnalysis`.
pub const ANALYSIS_INSTRUCTIONS: &str = r#"You are analyzing an audio or video recording. Produce a transcript, a summary and a dossier for every speaker.

1. Full transcript with timestamps.
2. Key topics discussed, in the original language of the recording.
3. Summary and overall insights, in the original language of the recording.
4. Identify speakers from what they say about themselves or each other: self-introductions, introductions by others, references to past roles or affiliations, and visual cues such as name tags. If a name is never mentioned, use a descriptor that fits the role (e.g. "Interviewer", "Guest Expert").
5. For each speaker, extract factual background information stated in the recording: full name, current and past roles and affiliations, factual statements about them, and views or beliefs they clearly express as their own. Include a short visual description when the speaker is visible.
6. Keep facts and views/beliefs apart. Opinions never go in "facts".
7. If some information is not available, omit that field.

Respond with a single JSON object and nothing else:
{
  "transcript": [
    {"speaker": "Speaker full name", "timestamp": "00:00:00", "text": "Spoken words"}
  ],
  "topics": ["Topic 1", "Topic 2"],
  "summary": "Overall insights and summary",
  "language": "Main language spoken",
  "speakers": [
    {
      "name": "Speaker full name or role descriptor",
      "roles_affiliations": [{"role": "Current role", "affiliation": "Current affiliation"}],
      "facts": ["Fact about the speaker"],
      "views_beliefs": ["View or belief"],
      "visual_description": "How the speaker appears"
    }
  ]
}

Do not include speculative or inferred information."#;

/// Prompt for the repair model. It may only fix syntax.
pub fn repair_prompt(malformed: &str) -> String {
    format!(
        "The following JSON is malformed. Fix ONLY the JSON format issues, not the content. \
         Do not add or remove any data. Return ONLY the fixed JSON with no additional text \
         or explanations:\n\n{}",
        malformed
    )
}
