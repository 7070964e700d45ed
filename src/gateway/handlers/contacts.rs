//! Contact lookups.

use super::*;
use crate::gateway::events::ContactHandle;

const DB_CHANNEL: &str = "contacts-from-disk";
const VCF_CHANNEL: &str = "contacts-from-vcf";

/// Fill in first and last names for the handles the client sent.
pub(super) async fn handle_from_db(
    mut handles: Vec<ContactHandle>,
    ctx: &GatewayContext,
) -> HandlerResult {
    let contacts = match &ctx.collaborators.contacts {
        Some(contacts) if contacts.is_connected() => contacts,
        _ => return Err(server_error(DB_CHANNEL, "Contacts repository is disconnected!")),
    };

    for handle in &mut handles {
        let Some(address) = handle.address.as_deref() else {
            continue;
        };
        let found = contacts
            .contact_by_address(address)
            .await
            .map_err(|e| server_error(DB_CHANNEL, e.to_string()))?;
        if let Some(contact) = found {
            handle.first_name = contact.first_name;
            handle.last_name = contact.last_name;
        }
    }
    Ok(Dispatch::ok(DB_CHANNEL, to_data(&handles)?))
}

/// Export the host address book and return it as vCard text.
pub(super) async fn handle_from_vcf(ctx: &GatewayContext) -> HandlerResult {
    let dir = ctx.contacts_dir();
    ctx.collaborators
        .actions
        .export_contacts(&dir)
        .await
        .map_err(|e| server_error(VCF_CHANNEL, e.to_string()))?;

    let path = dir.join("AddressBook.vcf");
    match tokio::fs::read_to_string(&path).await {
        Ok(vcf) => Ok(Dispatch::ok(VCF_CHANNEL, Value::String(vcf))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(server_error(VCF_CHANNEL, "Failed to export Address Book!"))
        }
        Err(e) => Err(server_error(VCF_CHANNEL, e.to_string())),
    }
}
