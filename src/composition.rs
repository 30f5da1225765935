//! Line-item composition resolver.
//!
//! Turns the unordered lines of an order into the sequence that is persisted
//! and submitted:
//!
//! 1. primary lines, each followed by the bonus lines it earned
//! 2. combo/kit groups as contiguous blocks, each member followed by its bonuses
//! 3. bonus lines that could not be attributed to anything (orphans)
//!
//! and numbers the result `1..=N`. The resolver is a pure function: the same
//! input always yields the same output, and it never fails. Attribution
//! ambiguity is settled by a fixed precedence instead of an error.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{non_empty, round_money, OrderItem};

/// Why a line sits where it does in the resolved sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LineRole {
    Primary,
    #[serde(rename_all = "camelCase")]
    Bonus { parent_item_id: String },
    #[serde(rename_all = "camelCase")]
    ComboMember { group_key: String },
    OrphanBonus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLine {
    pub role: LineRole,
    /// The original line with `lineNumber` assigned.
    #[serde(flatten)]
    pub item: OrderItem,
}

impl ResolvedLine {
    pub fn line_number(&self) -> u32 {
        self.item.line_number.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComboKind {
    Combo,
    Kit,
}

/// One logical combo/kit purchase. Derived on every resolution, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComboGroup {
    pub key: String,
    pub kind: ComboKind,
    pub name: Option<String>,
    /// Member item ids in first-seen order.
    pub item_ids: Vec<String>,
    pub total_price: f64,
    pub pack_price: f64,
    pub packs_qty: u32,
    /// `packs_qty` was not supplied by any member and was approximated
    /// as `round(total_price / pack_price)`.
    pub packs_inferred: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub lines: Vec<ResolvedLine>,
    pub groups: Vec<ComboGroup>,
}

impl Resolution {
    /// Resolved items in emission order.
    pub fn items(&self) -> Vec<OrderItem> {
        self.lines.iter().map(|line| line.item.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Sort keys
// ---------------------------------------------------------------------------

/// (provider, line, description, product id), lowercased. Empty sorts first.
fn primary_sort_key(item: &OrderItem) -> [String; 4] {
    [
        item.provider_key().to_lowercase(),
        item.line_key().to_lowercase(),
        item.description().to_lowercase(),
        item.producto_id.trim().to_lowercase(),
    ]
}

fn by_primary_key(items: &[OrderItem], a: usize, b: usize) -> Ordering {
    primary_sort_key(&items[a])
        .cmp(&primary_sort_key(&items[b]))
        .then(a.cmp(&b))
}

fn by_bonus_key(items: &[OrderItem], a: usize, b: usize) -> Ordering {
    items[a]
        .description()
        .to_lowercase()
        .cmp(&items[b].description().to_lowercase())
        .then_with(|| by_primary_key(items, a, b))
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// `comboGroupId` when present, otherwise
/// `(comboId|kitId|comboCode|id)::(packsQty,packPrice)::offerCode`.
pub fn group_key(item: &OrderItem) -> String {
    if let Some(group_id) = non_empty(&item.combo_group_id) {
        return group_id.to_string();
    }
    let reference = non_empty(&item.combo_id)
        .or_else(|| non_empty(&item.kit_id))
        .or_else(|| non_empty(&item.combo_code))
        .unwrap_or_else(|| item.id.trim());
    let packs = item
        .combo_packs_qty
        .map(|qty| qty.to_string())
        .unwrap_or_default();
    let pack_price = item
        .combo_pack_price
        .map(|price| format!("{price:.2}"))
        .unwrap_or_default();
    let offer = non_empty(&item.offer_code).unwrap_or("");
    format!("{reference}::{packs},{pack_price}::{offer}")
}

fn is_kit(item: &OrderItem) -> bool {
    non_empty(&item.kit_id).is_some()
        || non_empty(&item.combo_type).is_some_and(|kind| kind.eq_ignore_ascii_case("kit"))
}

fn build_group(key: String, items: &[OrderItem], members: &[usize]) -> ComboGroup {
    let member_items: Vec<&OrderItem> = members.iter().map(|&i| &items[i]).collect();

    let total_price = round_money(member_items.iter().map(|item| item.subtotal()).sum());
    let declared_pack_price = member_items
        .iter()
        .filter_map(|item| item.combo_pack_price)
        .find(|price| *price > 0.0);
    let declared_packs = member_items
        .iter()
        .filter_map(|item| item.combo_packs_qty)
        .find(|qty| *qty > 0);

    let (packs_qty, packs_inferred) = match (declared_packs, declared_pack_price) {
        (Some(qty), _) => (qty, false),
        (None, Some(price)) => (((total_price / price).round() as u32).max(1), true),
        (None, None) => (1, true),
    };
    let pack_price = declared_pack_price
        .unwrap_or_else(|| round_money(total_price / f64::from(packs_qty)));

    ComboGroup {
        key,
        kind: if member_items.iter().any(|item| is_kit(item)) {
            ComboKind::Kit
        } else {
            ComboKind::Combo
        },
        name: member_items
            .iter()
            .find_map(|item| non_empty(&item.combo_name))
            .map(str::to_string),
        item_ids: member_items.iter().map(|item| item.id.clone()).collect(),
        total_price,
        pack_price,
        packs_qty,
        packs_inferred,
    }
}

/// (provider or combo name, combo name or description or code), lowercased.
fn group_sort_key(items: &[OrderItem], members: &[usize]) -> (String, String) {
    let first = &items[members[0]];
    let combo_name = members
        .iter()
        .find_map(|&i| non_empty(&items[i].combo_name))
        .unwrap_or("");
    let provider = match first.provider_key() {
        "" => combo_name,
        provider => provider,
    };
    let label = if !combo_name.is_empty() {
        combo_name
    } else if !first.description().is_empty() {
        first.description()
    } else {
        non_empty(&first.combo_code).unwrap_or("")
    };
    (provider.to_lowercase(), label.to_lowercase())
}

// ---------------------------------------------------------------------------
// Attribution
// ---------------------------------------------------------------------------

/// Parent index for a bonus line, by precedence:
/// explicit parent/related id (primary or combo line), shared promo among
/// primaries, shared product among primaries, then among combo lines.
fn find_parent(
    items: &[OrderItem],
    bonus: usize,
    primaries: &[usize],
    combos: &[usize],
) -> Option<usize> {
    let item = &items[bonus];

    let explicit_ids = non_empty(&item.parent_item_id)
        .into_iter()
        .chain(item.related_item_ids.iter().map(|id| id.trim()))
        .filter(|id| !id.is_empty());
    for wanted in explicit_ids {
        let hit = primaries
            .iter()
            .chain(combos.iter())
            .copied()
            .find(|&candidate| items[candidate].id.trim() == wanted);
        if hit.is_some() {
            return hit;
        }
    }

    if let Some(promo) = non_empty(&item.promo_bonificacion_id) {
        let hit = primaries
            .iter()
            .copied()
            .find(|&candidate| non_empty(&items[candidate].promo_bonificacion_id) == Some(promo));
        if hit.is_some() {
            return hit;
        }
    }

    let product = item.producto_id.trim();
    if product.is_empty() {
        return None;
    }
    primaries
        .iter()
        .chain(combos.iter())
        .copied()
        .find(|&candidate| items[candidate].producto_id.trim() == product)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolve `items` into the final, numbered line sequence.
pub fn resolve_line_items(items: &[OrderItem]) -> Resolution {
    let mut combos = Vec::new();
    let mut primaries = Vec::new();
    let mut bonuses = Vec::new();
    for (index, item) in items.iter().enumerate() {
        if item.is_combo_linked() {
            combos.push(index);
        } else if item.es_bonificacion {
            bonuses.push(index);
        } else {
            primaries.push(index);
        }
    }

    primaries.sort_by(|&a, &b| by_primary_key(items, a, b));

    let mut grouped: Vec<(String, Vec<usize>)> = Vec::new();
    let mut group_slot: HashMap<String, usize> = HashMap::new();
    for &index in &combos {
        let key = group_key(&items[index]);
        match group_slot.get(&key) {
            Some(&slot) => grouped[slot].1.push(index),
            None => {
                group_slot.insert(key.clone(), grouped.len());
                grouped.push((key, vec![index]));
            }
        }
    }
    // Stable sort keeps first-seen order between equal groups.
    grouped.sort_by_cached_key(|(_, members)| group_sort_key(items, members));

    // Candidates are searched in emission order, so resolving an already
    // resolved sequence attributes every bonus to the same parent.
    let combo_order: Vec<usize> = grouped
        .iter()
        .flat_map(|(_, members)| members.iter().copied())
        .collect();
    let mut earned: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut orphans = Vec::new();
    for &bonus in &bonuses {
        match find_parent(items, bonus, &primaries, &combo_order) {
            Some(parent) => earned.entry(parent).or_default().push(bonus),
            None => orphans.push(bonus),
        }
    }
    for list in earned.values_mut() {
        list.sort_by(|&a, &b| by_bonus_key(items, a, b));
    }
    orphans.sort_by(|&a, &b| by_bonus_key(items, a, b));

    let mut lines: Vec<ResolvedLine> = Vec::with_capacity(items.len());
    let mut emit = |index: usize, role: LineRole| {
        lines.push(ResolvedLine {
            role,
            item: items[index].clone(),
        });
    };
    let bonus_role = |parent: usize| LineRole::Bonus {
        parent_item_id: items[parent].id.clone(),
    };

    for &primary in &primaries {
        emit(primary, LineRole::Primary);
        for &bonus in earned.get(&primary).map(Vec::as_slice).unwrap_or_default() {
            emit(bonus, bonus_role(primary));
        }
    }
    for (key, members) in &grouped {
        for &member in members {
            emit(
                member,
                LineRole::ComboMember {
                    group_key: key.clone(),
                },
            );
            for &bonus in earned.get(&member).map(Vec::as_slice).unwrap_or_default() {
                emit(bonus, bonus_role(member));
            }
        }
    }
    for &orphan in &orphans {
        emit(orphan, LineRole::OrphanBonus);
    }

    for (position, line) in lines.iter_mut().enumerate() {
        line.item.line_number = Some(position as u32 + 1);
    }

    let groups = grouped
        .into_iter()
        .map(|(key, members)| build_group(key, items, &members))
        .collect();

    Resolution { lines, groups }
}
