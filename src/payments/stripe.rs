use url::Url;
use uuid::Uuid;

const PAYMENT_LINK_BASE: &str = "https://buy.stripe.com/";

/// Pre-built Stripe payment link tagged with the paying user.
pub fn payment_link(stripe_id: &str, user_id: Uuid) -> Result<String, url::ParseError> {
    let mut link = Url::parse(PAYMENT_LINK_BASE)?.join(stripe_id)?;
    link.query_pairs_mut()
        .append_pair("client_reference_id", &user_id.to_string());
    Ok(link.to_string())
}
