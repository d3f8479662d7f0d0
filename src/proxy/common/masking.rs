// Display masking for the token pool API. Nothing here is reversible;
// the rules only keep enough shape for an operator to recognize an account.

/// `***` + the last 10 characters; anything that short is fully starred.
pub fn token_preview(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let suffix: String = chars[chars.len() - 10..].iter().collect();
    format!("***{}", suffix)
}

/// Mask an email address.
///
/// Local part: keep the first 2 and last 2 characters, star the middle
/// (4 or fewer characters: all stars). Domain: a single label is fully
/// starred; two labels star the first and keep the TLD; three or more keep
/// the last two labels and star the rest.
pub fn mask_email(email: &str) -> String {
    if email.is_empty() {
        return String::new();
    }
    let Some((local, domain)) = email.split_once('@') else {
        return email.to_string();
    };

    let local_chars: Vec<char> = local.chars().collect();
    let masked_local = if local_chars.len() <= 4 {
        "*".repeat(local_chars.len())
    } else {
        let prefix: String = local_chars[..2].iter().collect();
        let suffix: String = local_chars[local_chars.len() - 2..].iter().collect();
        format!("{}{}{}", prefix, "*".repeat(local_chars.len() - 4), suffix)
    };

    let labels: Vec<&str> = domain.split('.').collect();
    let masked_domain = match labels.len() {
        1 => "*".repeat(domain.chars().count()),
        2 => format!("{}.{}", "*".repeat(labels[0].chars().count()), labels[1]),
        n => {
            let mut parts: Vec<String> = labels[..n - 2]
                .iter()
                .map(|l| "*".repeat(l.chars().count()))
                .collect();
            parts.push(labels[n - 2].to_string());
            parts.push(labels[n - 1].to_string());
            parts.join(".")
        }
    };

    format!("{}@{}", masked_local, masked_domain)
}

/// Keep the first 5 and last 3 characters of an IdC client id.
pub fn mask_client_id(client_id: &str) -> String {
    let chars: Vec<char> = client_id.chars().collect();
    if chars.len() <= 10 {
        return client_id.to_string();
    }
    let prefix: String = chars[..5].iter().collect();
    let suffix: String = chars[chars.len() - 3..].iter().collect();
    format!("{}***{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_preview_long() {
        assert_eq!(token_preview("abcdefghijklmnop"), "***ghijklmnop");
    }

    #[test]
    fn test_token_preview_short() {
        assert_eq!(token_preview("abc"), "***");
        assert_eq!(token_preview("0123456789"), "**********");
        assert_eq!(token_preview(""), "");
    }

    #[test]
    fn test_mask_email_two_label_domain() {
        assert_eq!(mask_email("caidaoli@gmail.com"), "ca****li@*****.com");
    }

    #[test]
    fn test_mask_email_three_label_domain() {
        assert_eq!(mask_email("caidaolihz888@sun.edu.pl"), "ca*********88@***.edu.pl");
    }

    #[test]
    fn test_mask_email_short_local() {
        assert_eq!(mask_email("ab@x.co"), "**@*.co");
        assert_eq!(mask_email("abcd@x.co"), "****@*.co");
    }

    #[test]
    fn test_mask_email_single_label_domain() {
        assert_eq!(mask_email("user1@localhost"), "us*r1@*********");
    }

    #[test]
    fn test_mask_email_not_an_email() {
        assert_eq!(mask_email("not-an-email"), "not-an-email");
        assert_eq!(mask_email(""), "");
    }

    #[test]
    fn test_mask_client_id() {
        assert_eq!(mask_client_id("abcdefghijklmno"), "abcde***mno");
        assert_eq!(mask_client_id("short"), "short");
    }

    use proptest::prelude::*;

    proptest! {
        /// Masking keeps the @, the TLD label, and the local-part length.
        #[test]
        fn prop_mask_email_preserves_shape(
            local in "[a-z0-9]{1,16}",
            label in "[a-z]{1,8}",
            tld in "[a-z]{2,4}",
        ) {
            let email = format!("{}@{}.{}", local, label, tld);
            let masked = mask_email(&email);

            let (mlocal, mdomain) = masked.split_once('@').unwrap();
            prop_assert_eq!(mlocal.chars().count(), local.chars().count());
            let expected_suffix = format!(".{}", tld);
            prop_assert!(mdomain.ends_with(&expected_suffix));
        }

        /// Long tokens always reduce to the fixed 13-character preview.
        #[test]
        fn prop_token_preview_length(token in "[a-zA-Z0-9]{11,64}") {
            let preview = token_preview(&token);
            prop_assert_eq!(preview.chars().count(), 13);
            prop_assert!(preview.starts_with("***"));
            prop_assert!(token.ends_with(&preview[3..]));
        }
    }
}
