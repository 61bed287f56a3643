use core_types::{Attachment, Capabilities, ProviderId, StructuredResponse};

pub const SYSTEM_WARNING_SOURCE: &str = "System Warning";

/// Returns the notice to show instead of an answer, or `None` when the send may proceed.
pub fn check_attachment(
    capabilities: Capabilities,
    attachment: Option<&Attachment>,
    limitation: &str,
    alternative: ProviderId,
) -> Option<StructuredResponse> {
    let file = attachment.filter(|file| file.is_binary)?;
    if capabilities.vision {
        return None;
    }
    let text = format!(
        "I cannot see images or PDFs {limitation}. Please switch to **{}** in Settings to analyze `{}`.",
        alternative.display_name(),
        file.name
    );
    Some(
        StructuredResponse::new(text, vec![SYSTEM_WARNING_SOURCE.to_string()], 100.0)
            .with_analysis("File Analysis", format!("Unsupported {} input", file.mime_type)),
    )
}
