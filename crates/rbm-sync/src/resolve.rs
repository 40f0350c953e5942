//! Merge of all partitions' raw output into one deduplicated write batch.
//!
//! Everything here is a pure function of its inputs; callers do the logging.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use rbm_core::{
    normalize_contact, normalize_subject_name, Booking, CachedDetail, Channel, DirectoryEntry, RawBooking,
    DEFAULT_DURATION_MINUTES,
};
use serde::Serialize;

/// Two bookings that claim the same contact at the same start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub contact: String,
    pub scheduled_start: NaiveDateTime,
    pub kept: String,
    pub dropped: String,
    pub kept_channel: Channel,
    pub dropped_channel: Channel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub input: usize,
    pub duplicate_ids: usize,
    pub contacts_from_cache: usize,
    pub contacts_from_directory: usize,
    pub contacts_missing: usize,
    /// Collisions settled by the direct-repeat over marketplace rule.
    pub channel_overrides: Vec<Collision>,
    /// Any other collision. The first seen record was kept.
    pub anomalies: Vec<Collision>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub batch: Vec<Booking>,
    pub report: ResolveReport,
}

/// Exact-name lookup into the customer directory.
///
/// A name listed with two different contacts is ambiguous and never matches.
#[derive(Debug, Default)]
pub struct DirectoryIndex {
    by_name: HashMap<String, Option<String>>,
}

impl DirectoryIndex {
    pub fn new(entries: &[DirectoryEntry]) -> Self {
        let mut by_name: HashMap<String, Option<String>> = HashMap::new();
        for entry in entries {
            let Some(contact) = entry.contact.as_deref().and_then(normalize_contact) else {
                continue;
            };
            let name = normalize_subject_name(&entry.name);
            if name.is_empty() {
                continue;
            }
            by_name
                .entry(name)
                .and_modify(|existing| {
                    if existing.as_deref() != Some(contact.as_str()) {
                        *existing = None;
                    }
                })
                .or_insert(Some(contact));
        }
        Self { by_name }
    }

    pub fn contact_for(&self, normalized_name: &str) -> Option<&str> {
        self.by_name.get(normalized_name).and_then(|c| c.as_deref())
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Normalize the name, then fill contact, service and channel from the cache
/// and the directory.
fn complete(
    raw: &RawBooking,
    cached: Option<&CachedDetail>,
    directory: &DirectoryIndex,
    report: &mut ResolveReport,
) -> Booking {
    let subject_name = normalize_subject_name(&raw.subject_name);

    let contact = match raw.contact.as_deref().and_then(normalize_contact) {
        Some(contact) => Some(contact),
        None => {
            if let Some(contact) = cached.and_then(|c| c.contact.as_deref()).and_then(normalize_contact) {
                report.contacts_from_cache += 1;
                Some(contact)
            } else if let Some(contact) = directory.contact_for(&subject_name) {
                report.contacts_from_directory += 1;
                Some(contact.to_string())
            } else {
                report.contacts_missing += 1;
                None
            }
        }
    };

    Booking {
        booking_id: raw.booking_id.clone(),
        subject_name,
        contact,
        scheduled_start: raw.scheduled_start,
        staff: non_blank(raw.staff.as_ref()),
        service: non_blank(raw.service.as_ref()).or_else(|| cached.and_then(|c| non_blank(c.service.as_ref()))),
        channel: raw
            .channel
            .or_else(|| cached.and_then(|c| c.channel))
            .unwrap_or(Channel::Other),
        duration_minutes: raw.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES),
    }
}

fn collision(kept: &Booking, dropped: &Booking, contact: &str) -> Collision {
    Collision {
        contact: contact.to_string(),
        scheduled_start: kept.scheduled_start,
        kept: kept.booking_id.clone(),
        dropped: dropped.booking_id.clone(),
        kept_channel: kept.channel,
        dropped_channel: dropped.channel,
    }
}

/// Turn the concatenated raw tuples of every partition into the write batch.
pub fn resolve(
    raw: &[RawBooking],
    cache: &HashMap<String, CachedDetail>,
    directory: &[DirectoryEntry],
) -> Resolution {
    let directory = DirectoryIndex::new(directory);
    let mut report = ResolveReport {
        input: raw.len(),
        ..ResolveReport::default()
    };
    let mut seen_ids = HashSet::new();
    let mut by_slot: HashMap<(String, NaiveDateTime), usize> = HashMap::new();
    let mut batch: Vec<Booking> = Vec::with_capacity(raw.len());

    for record in raw {
        if !seen_ids.insert(record.booking_id.as_str()) {
            report.duplicate_ids += 1;
            continue;
        }
        let booking = complete(record, cache.get(&record.booking_id), &directory, &mut report);

        let Some(contact) = booking.contact.clone() else {
            batch.push(booking);
            continue;
        };
        let slot = (contact, booking.scheduled_start);
        let Some(&index) = by_slot.get(&slot) else {
            by_slot.insert(slot, batch.len());
            batch.push(booking);
            continue;
        };

        let existing = &batch[index];
        match (existing.channel, booking.channel) {
            (Channel::Marketplace, Channel::DirectRepeat) => {
                report.channel_overrides.push(collision(&booking, existing, &slot.0));
                batch[index] = booking;
            }
            (Channel::DirectRepeat, Channel::Marketplace) => {
                report.channel_overrides.push(collision(existing, &booking, &slot.0));
            }
            _ => {
                report.anomalies.push(collision(existing, &booking, &slot.0));
            }
        }
    }

    Resolution { batch, report }
}
