//! Chat response and install-page rendering.

use kudos_types::{GrantReceipt, Identity};

/// Mention text echoed back into the channel, preserving the form the
/// sender used.
pub(crate) fn slack_mention(target: &Identity) -> String {
    match target {
        Identity::External(id) => format!("<@{id}>"),
        Identity::Username(name) => format!("@{name}"),
    }
}

pub(crate) fn googlechat_mention(target: &Identity) -> String {
    match target {
        Identity::External(id) => format!("<users/{id}>"),
        Identity::Username(name) => format!("@{name}"),
    }
}

pub(crate) fn slack_celebration(target: &Identity, receipt: &GrantReceipt) -> String {
    format!(
        "Kudos to {} for {}! \u{1F389}\nThey now have {} total kudos.",
        slack_mention(target),
        receipt.description,
        receipt.total,
    )
}

pub(crate) fn googlechat_celebration(target: &Identity, receipt: &GrantReceipt) -> String {
    format!(
        "\u{1F389} Kudos to {} for {}!\n\nThey now have *{}* total kudos.",
        googlechat_mention(target),
        receipt.description,
        receipt.total,
    )
}

pub(crate) fn install_success_page(team_name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
  <head><title>Kudos installed</title></head>
  <body>
    <h1>Successfully installed the Kudos app!</h1>
    <p>Workspace: {team_name}</p>
    <p>Try it out with <code>/kudos @user description</code>.</p>
  </body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::{googlechat_celebration, slack_celebration, slack_mention};
    use chrono::Utc;
    use kudos_types::{GrantReceipt, Identity, Platform};

    fn receipt(total: i64) -> GrantReceipt {
        GrantReceipt {
            recipient_username: "bob".to_string(),
            sender_username: "alice".to_string(),
            description: "great work".to_string(),
            platform: Platform::Slack,
            total,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn mention_preserves_sender_form() {
        assert_eq!(
            slack_mention(&Identity::External("U123".to_string())),
            "<@U123>"
        );
        assert_eq!(
            slack_mention(&Identity::Username("bob".to_string())),
            "@bob"
        );
    }

    #[test]
    fn slack_celebration_names_total() {
        let text = slack_celebration(&Identity::Username("bob".to_string()), &receipt(3));
        assert!(text.contains("Kudos to @bob for great work!"));
        assert!(text.contains("3 total kudos"));
    }

    #[test]
    fn googlechat_celebration_uses_platform_mention() {
        let text =
            googlechat_celebration(&Identity::External("123".to_string()), &receipt(1));
        assert!(text.contains("<users/123>"));
        assert!(text.contains("*1* total kudos"));
    }
}
