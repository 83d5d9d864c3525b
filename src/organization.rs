// Copyright 2021-2022 Jacob Alexander
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! KLL data organization.
//!
//! Each context carries one [`Organization`]: nine typed stores that
//! symbolically hold expressions keyed by their unique keys. Every insertion
//! is recorded in an append-only merge log; replaying the log is what makes
//! cross-context merge order and the reduction pass deterministic.

use crate::context::ContextKind;
use crate::expression::{Expression, MapExpression, Operator};
use log::debug;
use std::collections::BTreeMap;
use std::fmt;

/// One merge-log record: key, the expression inserted, and whether the
/// entry is still live after pruning
#[derive(Debug, Clone)]
pub struct LogEntry<T> {
    pub key: String,
    pub expr: T,
    pub enabled: bool,
}

/// Insertion behavior of the simple stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// Insert or replace by key
    Replace,
    /// Positions update the existing association axis-wise
    UpdatePositions,
    /// Indexed array writes merge into a sparse list
    MergeArrays,
}

/// Store for everything except trigger mappings: one expression per key
#[derive(Debug, Clone)]
pub struct DataStore {
    pub name: &'static str,
    pub data: BTreeMap<String, Expression>,
    pub merge_in_log: Vec<LogEntry<Expression>>,
    pub connect_id: u8,
    policy: StorePolicy,
}

impl DataStore {
    pub fn new(name: &'static str, policy: StorePolicy) -> Self {
        Self {
            name,
            data: BTreeMap::new(),
            merge_in_log: vec![],
            connect_id: 0,
            policy,
        }
    }

    pub fn add_expression(&mut self, expression: &Expression) {
        for (key, uniq_expr) in expression.unique_keys() {
            match self.policy {
                StorePolicy::Replace => {
                    self.data.insert(key.clone(), uniq_expr.clone());
                }
                StorePolicy::UpdatePositions => {
                    let updated = match self.data.get_mut(&key) {
                        Some(Expression::DataAssociation(existing)) => {
                            if let Expression::DataAssociation(new) = &uniq_expr {
                                existing.update(new);
                            }
                            true
                        }
                        Some(_) => false,
                        None => false,
                    };
                    if !updated {
                        self.data.insert(key.clone(), uniq_expr.clone());
                    }
                }
                StorePolicy::MergeArrays => {
                    let indexed_array = matches!(
                        &uniq_expr,
                        Expression::Assignment(a) if a.pos.is_some()
                    );
                    let merged = if indexed_array {
                        match self.data.get_mut(&key) {
                            Some(Expression::Assignment(existing)) => {
                                if let Expression::Assignment(new) = &uniq_expr {
                                    existing.merge_array(Some(new));
                                }
                                true
                            }
                            _ => false,
                        }
                    } else {
                        false
                    };
                    if !merged {
                        let mut value = uniq_expr.clone();
                        if indexed_array {
                            if let Expression::Assignment(a) = &mut value {
                                a.merge_array(None);
                            }
                        }
                        self.data.insert(key.clone(), value);
                    }
                }
            }
            self.merge_in_log.push(LogEntry {
                key,
                expr: uniq_expr,
                enabled: true,
            });
        }
    }

    /// Merge another store of the same kind into this one
    pub fn merge(&mut self, merge_in: &DataStore, _map_type: ContextKind) {
        for expression in merge_in.data.values() {
            self.add_expression(expression);
        }
    }
}

impl fmt::Display for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.data {
            writeln!(f, "{: <20} > {}", key, value)?;
        }
        Ok(())
    }
}

/// Operator class of a mapping-store key prefix
fn key_operator(key: &str) -> Operator {
    for prefix in ["i::", "::", "i:+", ":+", "i:-", ":-", "i:", ":"] {
        if key.starts_with(prefix) {
            return Operator::from_str(prefix).unwrap();
        }
    }
    Operator::Set
}

/// Trigger mapping store. The operator is part of the key, so different
/// operators on the same trigger coexist until merge time. Values are
/// lists because `:+` stacks.
#[derive(Debug, Clone, Default)]
pub struct MappingStore {
    pub data: BTreeMap<String, Vec<MapExpression>>,
    pub merge_in_log: Vec<LogEntry<MapExpression>>,
    pub connect_id: u8,
}

impl MappingStore {
    pub fn add_expression(&mut self, expression: &MapExpression) {
        for (ukey, uniq_expr) in expression.unique_keys() {
            let Expression::Map(uniq_expr) = uniq_expr else {
                continue;
            };
            let key = format!("{}{}", expression.operator, ukey);
            let exists = self.data.contains_key(&key);

            if expression.operator.is_append() || expression.operator.is_remove() {
                // Duplicate appends/removals are skipped
                if exists
                    && self.data[&key]
                        .iter()
                        .any(|elem| elem.to_string() == uniq_expr.to_string())
                {
                    debug!("DUP KEY <== {}", key);
                    continue;
                }
                self.data.entry(key.clone()).or_default().push(uniq_expr.clone());
            } else {
                self.data.insert(key.clone(), vec![uniq_expr.clone()]);
            }

            self.merge_in_log.push(LogEntry {
                key,
                expr: uniq_expr,
                enabled: true,
            });
        }
    }

    /// Ordered unique key list from another store's merge log
    fn ordered_keys(merge_in: &MappingStore) -> Vec<String> {
        let mut keys: Vec<String> = vec![];
        for entry in merge_in.merge_in_log.iter().rev() {
            if !keys.contains(&entry.key) {
                keys.insert(0, entry.key.clone());
            }
        }
        keys
    }

    /// Merge in another mapping store.
    ///
    /// Keys are partitioned by operator class and applied lazy-set first,
    /// then set, then append, then remove; the incoming merge log is
    /// concatenated afterwards so later merges see the whole history.
    pub fn merge(&mut self, merge_in: &MappingStore, map_type: ContextKind) {
        let keys = Self::ordered_keys(merge_in);
        let lazy_keys: Vec<&String> = keys
            .iter()
            .filter(|k| key_operator(k).is_lazy())
            .collect();
        let append_keys: Vec<&String> = keys
            .iter()
            .filter(|k| key_operator(k).is_append())
            .collect();
        let remove_keys: Vec<&String> = keys
            .iter()
            .filter(|k| key_operator(k).is_remove())
            .collect();
        let set_keys: Vec<&String> = keys
            .iter()
            .filter(|k| key_operator(k).is_set())
            .collect();

        // A log key may no longer be backed by data (an earlier removal
        // already consumed it); those entries have nothing left to apply

        // Lazy set: held verbatim, applied during reduction
        for key in lazy_keys {
            let Some(value) = merge_in.data.get(key.as_str()) else {
                continue;
            };
            let mut value = value.clone();
            if map_type != ContextKind::BaseMap {
                if let Some(first) = value.first_mut() {
                    first.base_map = false;
                }
            }
            self.data.insert(key.to_string(), value);
        }

        // Set: replace wholesale
        for key in set_keys {
            let Some(value) = merge_in.data.get(key.as_str()) else {
                continue;
            };
            let mut value = value.clone();
            if map_type != ContextKind::BaseMap {
                if let Some(first) = value.first_mut() {
                    first.base_map = false;
                }
            }
            self.data.insert(key.to_string(), value);
        }

        // Append: extend the existing list
        for key in append_keys {
            let Some(value) = merge_in.data.get(key.as_str()) else {
                continue;
            };
            let value = value.clone();
            match self.data.get_mut(key.as_str()) {
                Some(existing) => existing.extend(value),
                None => {
                    self.data.insert(key.to_string(), value);
                }
            }
        }

        // Remove: drop matching expressions from the sibling set/append
        // lists; unmatched removals are dropped silently
        for key in remove_keys {
            let Some(removal_exprs) = merge_in.data.get(key.as_str()) else {
                continue;
            };
            let removals: Vec<(String, String)> = removal_exprs
                .iter()
                .map(|e| (e.trigger_str(), e.result_str()))
                .collect();
            let suffix = key
                .strip_prefix("i:-")
                .or_else(|| key.strip_prefix(":-"))
                .unwrap();
            let iso = key.starts_with('i');
            let siblings = if iso {
                [format!("i:{}", suffix), format!("i:+{}", suffix)]
            } else {
                [format!(":{}", suffix), format!(":+{}", suffix)]
            };
            let mut matched = false;
            for sibling in siblings {
                if let Some(existing) = self.data.get_mut(&sibling) {
                    let before = existing.len();
                    existing.retain(|e| {
                        !removals.contains(&(e.trigger_str(), e.result_str()))
                    });
                    matched |= existing.len() != before;
                    if existing.is_empty() {
                        self.data.remove(&sibling);
                    }
                }
            }
            if !matched {
                debug!("DRP KEY <== {}", key);
            }
        }

        self.merge_in_log.extend(merge_in.merge_in_log.iter().cloned());
    }

    /// Prune the merge log: reverse scan, the last entry per key stays
    /// enabled, earlier ones are disabled
    pub fn merge_in_log_prune(&mut self) -> Vec<LogEntry<MapExpression>> {
        let mut found: Vec<String> = vec![];
        let mut kept = vec![];
        for entry in self.merge_in_log.iter_mut().rev() {
            if !found.contains(&entry.key) {
                found.push(entry.key.clone());
                kept.insert(0, entry.clone());
            } else {
                entry.enabled = false;
            }
        }
        kept
    }

    /// Single-ScanCode lookup: result string -> store keys
    fn result_code_lookup(&self) -> BTreeMap<String, Vec<String>> {
        let mut lookup: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, exprs) in &self.data {
            let Some(first) = exprs.first() else { continue };
            let single_scan = first.elems().0 == 1
                && first
                    .trigger_id_list()
                    .first()
                    .map(|id| matches!(id, crate::types::Identifier::ScanCode(_)))
                    .unwrap_or(false);
            if single_scan {
                lookup
                    .entry(first.result_str())
                    .or_default()
                    .push(key.clone());
            }
        }
        lookup
    }

    /// Resolve held `::` entries against the single-ScanCode lookup;
    /// entries that still have no target are left for the emitters to
    /// ignore
    fn merge_lazy_operators(&mut self) {
        let lookup = self.result_code_lookup();

        let mut seen: Vec<String> = vec![];
        let mut rewrites: Vec<(String, MapExpression)> = vec![];
        for entry in self.merge_in_log.iter().rev() {
            if !key_operator(&entry.key).is_lazy() || seen.contains(&entry.key) {
                continue;
            }
            seen.push(entry.key.clone());
            debug!("Lazy {} {}", entry.key, entry.expr);

            let target = entry.expr.trigger_str();
            if let Some(target_keys) = lookup.get(&target) {
                for target_key in target_keys {
                    rewrites.push((target_key.clone(), entry.expr.clone()));
                }
            }
        }

        for (target_key, lazy_expr) in rewrites {
            let Some(orig) = self.data.get(&target_key).and_then(|v| v.first()).cloned()
            else {
                continue;
            };
            let mut new_expr =
                MapExpression::trigger_code(orig.triggers.clone(), orig.operator, lazy_expr.results);
            new_expr.connect_id = orig.connect_id;
            new_expr.base_map = false;
            self.data.insert(target_key, vec![new_expr]);
        }
    }

    /// Reduction: rewrite HID-code triggers into ScanCode triggers by
    /// replaying the merge log, then apply the lazy operators.
    pub fn reduction(&mut self) {
        self.merge_in_log_prune();
        let lookup = self.result_code_lookup();

        if self.data.is_empty() {
            return;
        }

        let log: Vec<LogEntry<MapExpression>> = self.merge_in_log.clone();
        for entry in log {
            if !entry.enabled {
                continue;
            }
            let Some(exprs) = self.data.get(&entry.key).cloned() else {
                continue;
            };

            for sub_expr in exprs {
                let (trigger_elems, _) = sub_expr.elems();

                // Single HID-code triggers are rewritten onto the scan
                // code bound to the same code
                if trigger_elems == 1
                    && sub_expr
                        .trigger_id_list()
                        .first()
                        .map(|id| id.is_hid_code())
                        .unwrap_or(false)
                {
                    let trigger_str = sub_expr.trigger_str();
                    match lookup.get(&trigger_str) {
                        Some(target_keys) => {
                            for new_key in target_keys {
                                let Some(orig) =
                                    self.data.get(new_key).and_then(|v| v.first()).cloned()
                                else {
                                    continue;
                                };
                                if sub_expr.operator.is_set() && !sub_expr.operator.is_lazy() {
                                    debug!("REPLACE {} -> {}", entry.key, new_key);
                                    let mut new_expr = MapExpression::trigger_code(
                                        orig.triggers.clone(),
                                        orig.operator,
                                        sub_expr.results.clone(),
                                    );
                                    new_expr.connect_id = orig.connect_id;
                                    new_expr.base_map = false;
                                    self.data.insert(new_key.clone(), vec![new_expr]);
                                } else if sub_expr.operator.is_append() {
                                    debug!("ADD {} -> {}", entry.key, new_key);
                                    let mut new_expr = MapExpression::trigger_code(
                                        orig.triggers.clone(),
                                        orig.operator,
                                        sub_expr.results.clone(),
                                    );
                                    new_expr.connect_id = orig.connect_id;
                                    let list = self.data.get_mut(new_key).unwrap();
                                    list.push(new_expr);
                                    for elem in list.iter_mut() {
                                        elem.base_map = false;
                                    }
                                } else if sub_expr.operator.is_remove() {
                                    debug!("REMOVE {} -> {}", entry.key, new_key);
                                    let result = sub_expr.result_str();
                                    let list = self.data.get_mut(new_key).unwrap();
                                    list.retain(|e| e.result_str() != result);
                                    if list.is_empty() {
                                        self.data.remove(new_key);
                                    }
                                }
                            }
                            self.data.remove(&entry.key);
                        }
                        // Unresolvable HID trigger, drop
                        None => {
                            debug!("DROP {}", entry.key);
                            self.data.remove(&entry.key);
                        }
                    }
                // Complex triggers have HID members substituted in place
                } else if trigger_elems > 1 {
                    let mut replaced = self.data.get(&entry.key).cloned().unwrap_or_default();
                    let mut drop = false;
                    for elem in &mut replaced {
                        for identifier in elem.trigger_id_list_mut() {
                            let ident_str = format!("({})", identifier);
                            if let Some(target_keys) = lookup.get(&ident_str) {
                                if let Some(scan) = target_keys
                                    .first()
                                    .and_then(|k| self.data.get(k))
                                    .and_then(|v| v.first())
                                    .and_then(|e| e.trigger_id_list().first().copied().cloned())
                                {
                                    *identifier = scan;
                                }
                            } else if identifier.is_trigger_kind()
                                || matches!(identifier, crate::types::Identifier::Animation(_))
                            {
                                // Non-HID trigger kinds pass through
                            } else {
                                drop = true;
                            }
                        }
                    }
                    if drop {
                        debug!("DROP {}", entry.key);
                        self.data.remove(&entry.key);
                    } else {
                        self.data.insert(entry.key.clone(), replaced);
                    }
                }
            }
        }

        self.merge_lazy_operators();
    }

    /// Drop expressions still flagged as BaseMap-originated
    pub fn cleanup(&mut self) {
        self.data.retain(|key, exprs| {
            let keep = !exprs.first().map(|e| e.base_map).unwrap_or(false);
            if !keep {
                debug!("DROP {}", key);
            }
            keep
        });
    }

    /// Max trigger uid per connect id
    pub fn maxscancode(&self) -> BTreeMap<u8, u16> {
        let mut max_dict = BTreeMap::new();
        for exprs in self.data.values() {
            let Some(first) = exprs.first() else { continue };
            let entry = max_dict.entry(first.connect_id).or_insert(0);
            let max_uid = first.max_trigger_uid();
            if *entry < max_uid {
                *entry = max_uid;
            }
        }
        max_dict
    }
}

impl fmt::Display for MappingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, values) in &self.data {
            for value in values {
                writeln!(f, "{: <20} > {}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Container for all nine KLL datastructures of one context.
///
/// The stores hold expressions symbolically at first; merges and the
/// reduction pass slowly solve and deduplicate them. Since merge order
/// matters, this happens over several pipeline stages.
#[derive(Debug, Clone)]
pub struct Organization {
    pub animation_data: DataStore,
    pub animation_frame_data: DataStore,
    pub capability_data: DataStore,
    pub define_data: DataStore,
    pub mapping_data: MappingStore,
    pub pixel_channel_data: DataStore,
    pub pixel_position_data: DataStore,
    pub scan_code_position_data: DataStore,
    pub variable_data: DataStore,
}

impl Default for Organization {
    fn default() -> Self {
        Self {
            animation_data: DataStore::new("AnimationData", StorePolicy::Replace),
            animation_frame_data: DataStore::new("AnimationFrameData", StorePolicy::Replace),
            capability_data: DataStore::new("CapabilityData", StorePolicy::Replace),
            define_data: DataStore::new("DefineData", StorePolicy::Replace),
            mapping_data: MappingStore::default(),
            pixel_channel_data: DataStore::new("PixelChannelData", StorePolicy::Replace),
            pixel_position_data: DataStore::new("PixelPositionData", StorePolicy::UpdatePositions),
            scan_code_position_data: DataStore::new(
                "ScanCodePositionData",
                StorePolicy::UpdatePositions,
            ),
            variable_data: DataStore::new("VariableData", StorePolicy::MergeArrays),
        }
    }
}

impl Organization {
    /// Route an expression to its store by (class, subtype)
    pub fn add_expression(&mut self, expression: &Expression) {
        match expression.routing() {
            ("AssignmentExpression", _) => self.variable_data.add_expression(expression),
            ("NameAssociationExpression", "Capability") => {
                self.capability_data.add_expression(expression)
            }
            ("NameAssociationExpression", _) => self.define_data.add_expression(expression),
            ("DataAssociationExpression", "Animation") => {
                self.animation_data.add_expression(expression)
            }
            ("DataAssociationExpression", "AnimationFrame") => {
                self.animation_frame_data.add_expression(expression)
            }
            ("DataAssociationExpression", "PixelPosition") => {
                self.pixel_position_data.add_expression(expression)
            }
            ("DataAssociationExpression", _) => {
                self.scan_code_position_data.add_expression(expression)
            }
            ("MapExpression", "PixelChannel") => {
                self.pixel_channel_data.add_expression(expression)
            }
            ("MapExpression", _) => {
                if let Expression::Map(map) = expression {
                    self.mapping_data.add_expression(map)
                }
            }
            _ => {}
        }
    }

    pub fn merge(&mut self, merge_in: &Organization, map_type: ContextKind) {
        self.animation_data.merge(&merge_in.animation_data, map_type);
        self.animation_frame_data
            .merge(&merge_in.animation_frame_data, map_type);
        self.capability_data.merge(&merge_in.capability_data, map_type);
        self.define_data.merge(&merge_in.define_data, map_type);
        self.mapping_data.merge(&merge_in.mapping_data, map_type);
        self.pixel_channel_data
            .merge(&merge_in.pixel_channel_data, map_type);
        self.pixel_position_data
            .merge(&merge_in.pixel_position_data, map_type);
        self.scan_code_position_data
            .merge(&merge_in.scan_code_position_data, map_type);
        self.variable_data.merge(&merge_in.variable_data, map_type);
    }

    pub fn reduction(&mut self) {
        self.mapping_data.reduction();
    }

    pub fn cleanup(&mut self) {
        self.mapping_data.cleanup();
    }

    pub fn maxscancode(&self) -> BTreeMap<u8, u16> {
        self.mapping_data.maxscancode()
    }

    /// Simple stores in their canonical order (mapping data handled
    /// separately by callers that need it)
    pub fn data_stores(&self) -> [&DataStore; 8] {
        [
            &self.animation_data,
            &self.animation_frame_data,
            &self.capability_data,
            &self.define_data,
            &self.pixel_channel_data,
            &self.pixel_position_data,
            &self.scan_code_position_data,
            &self.variable_data,
        ]
    }
}

impl fmt::Display for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for store in self.data_stores() {
            if !store.data.is_empty() {
                writeln!(f, "\t{}", store.name)?;
                write!(f, "{}", store)?;
            }
        }
        if !self.mapping_data.data.is_empty() {
            writeln!(f, "\tMappingData")?;
            write!(f, "{}", self.mapping_data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layouts::Layouts;
    use crate::parser::parse_string;
    use std::sync::Arc;

    fn org_from(text: &str) -> Organization {
        let locale = Arc::new(Layouts::new().default_layout().clone());
        let mut org = Organization::default();
        for expr in parse_string(text, &locale).unwrap() {
            org.add_expression(&expr);
        }
        org
    }

    #[test]
    fn merge_replaces_same_trigger() {
        let mut a = org_from("S1 : U\"A\";\n");
        let b = org_from("S1 : U\"B\";\n");
        a.merge(&b, ContextKind::DefaultMap);
        assert_eq!(a.mapping_data.data.len(), 1);
        let exprs = a.mapping_data.data.values().next().unwrap();
        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].result_str(), "(U0x005)");
    }

    #[test]
    fn merge_is_associative_for_set() {
        let texts = ["S1 : U\"A\";\n", "S2 : U\"B\";\n", "S1 : U\"C\";\n"];
        // merge(A, merge(B, C))
        let mut bc = org_from(texts[1]);
        bc.merge(&org_from(texts[2]), ContextKind::DefaultMap);
        let mut right = org_from(texts[0]);
        right.merge(&bc, ContextKind::DefaultMap);
        // merge(merge(A, B), C)
        let mut left = org_from(texts[0]);
        left.merge(&org_from(texts[1]), ContextKind::DefaultMap);
        left.merge(&org_from(texts[2]), ContextKind::DefaultMap);

        let dump = |org: &Organization| format!("{}", org.mapping_data);
        assert_eq!(dump(&left), dump(&right));
    }

    #[test]
    fn append_then_remove_is_inverse() {
        let base = org_from("S1 : U\"A\";\n");
        let mut merged = base.clone();
        merged.merge(&org_from("S1 :+ U\"B\";\n"), ContextKind::DefaultMap);
        merged.merge(&org_from("S1 :- U\"B\";\n"), ContextKind::DefaultMap);

        let keys: Vec<&String> = merged.mapping_data.data.keys().collect();
        let base_keys: Vec<&String> = base.mapping_data.data.keys().collect();
        assert_eq!(keys, base_keys);
    }

    #[test]
    fn append_stacks_values() {
        let mut org = org_from("S1 :+ U\"A\";\n");
        org.merge(&org_from("S1 :+ U\"B\";\n"), ContextKind::DefaultMap);
        let exprs = org.mapping_data.data.get(":+0 S0x001").unwrap();
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn duplicate_append_is_skipped() {
        let org = org_from("S1 :+ U\"A\";\nS1 :+ U\"A\";\n");
        let exprs = org.mapping_data.data.get(":+0 S0x001").unwrap();
        assert_eq!(exprs.len(), 1);
    }

    #[test]
    fn reduction_rewrites_hid_triggers() {
        // S0x10 : U"A"; U"A" : U"B"; reduces to S0x10 : U"B"
        let mut org = org_from("S0x10 : U\"A\";\nU\"A\" : U\"B\";\n");
        org.reduction();
        assert_eq!(org.mapping_data.data.len(), 1);
        let exprs = org.mapping_data.data.values().next().unwrap();
        assert_eq!(exprs[0].trigger_str(), "(S0x010)");
        assert_eq!(exprs[0].result_str(), "(U0x005)");
    }

    #[test]
    fn reduction_drops_unresolvable_hid_triggers() {
        let mut org = org_from("U\"A\" : U\"B\";\n");
        org.reduction();
        assert!(org.mapping_data.data.is_empty());
    }

    #[test]
    fn reduction_appends_in_merge_order() {
        let mut org = org_from("S10 : U\"A\";\n");
        let overlay = org_from("U\"A\" :+ U\"B\";\nU\"A\" :+ U\"C\";\n");
        org.merge(&overlay, ContextKind::DefaultMap);
        org.reduction();

        let exprs = org.mapping_data.data.get(":0 S0x00a").unwrap();
        assert_eq!(exprs.len(), 3);
        assert_eq!(exprs[1].result_str(), "(U0x005)");
        assert_eq!(exprs[2].result_str(), "(U0x006)");
    }

    #[test]
    fn lazy_set_applies_after_reduction() {
        let mut org = org_from("S1 : U\"A\";\n");
        org.merge(&org_from("U\"A\" :: U\"B\";\n"), ContextKind::DefaultMap);
        org.reduction();

        let exprs = org.mapping_data.data.get(":0 S0x001").unwrap();
        assert_eq!(exprs[0].result_str(), "(U0x005)");
    }

    #[test]
    fn lazy_set_without_target_is_discarded() {
        let mut org = org_from("S1 : U\"A\";\n");
        org.merge(&org_from("U\"Q\" :: U\"B\";\n"), ContextKind::DefaultMap);
        org.reduction();

        // The scan code mapping is untouched, the lazy entry is gone
        let exprs = org.mapping_data.data.get(":0 S0x001").unwrap();
        assert_eq!(exprs[0].result_str(), "(U0x004)");
        assert!(!org.mapping_data.data.keys().any(|k| k.starts_with("::")));
    }

    #[test]
    fn multi_trigger_members_substituted() {
        // The HID member of a combo resolves to its bound scan code
        let mut org = org_from("S1 : U\"A\";\nU\"A\" + S2 : U\"B\";\n");
        org.reduction();

        let combo_expr = org
            .mapping_data
            .data
            .values()
            .find(|exprs| exprs[0].elems().0 == 2)
            .expect("combo expression kept");
        assert_eq!(combo_expr[0].trigger_str(), "(S0x001 + S0x002)");
    }

    #[test]
    fn cleanup_drops_base_map_expressions() {
        let mut org = org_from("S1 : U\"A\";\n");
        for exprs in org.mapping_data.data.values_mut() {
            exprs[0].base_map = true;
        }
        org.merge(&org_from("S2 : U\"B\";\n"), ContextKind::PartialMap(0));
        org.cleanup();

        assert_eq!(org.mapping_data.data.len(), 1);
        let exprs = org.mapping_data.data.values().next().unwrap();
        assert_eq!(exprs[0].trigger_str(), "(S0x002)");
    }

    #[test]
    fn merge_log_prune_keeps_last_entry() {
        let mut org = org_from("S1 : U\"A\";\nS1 : U\"B\";\n");
        let pruned = org.mapping_data.merge_in_log_prune();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].expr.result_str(), "(U0x005)");
        // Earlier entry flipped to disabled in place
        assert!(!org.mapping_data.merge_in_log[0].enabled);
    }

    #[test]
    fn variable_store_merges_arrays() {
        let org = org_from("Name[0] = first;\nName[2] = third;\n");
        let Expression::Assignment(assign) = org.variable_data.data.get("Name").unwrap() else {
            panic!("expected an assignment");
        };
        assert_eq!(assign.value_list(), vec!["first", "", "third"]);
    }

    #[test]
    fn position_store_updates_axes() {
        let org = org_from("S1 <= x:1,y:2;\nS1 <= x:5;\n");
        let Expression::DataAssociation(data) =
            org.scan_code_position_data.data.get("S001").unwrap()
        else {
            panic!("expected a data association");
        };
        let crate::expression::DataAssociation::ScanCodePosition { scancodes } =
            &data.association
        else {
            panic!("expected scan code positions");
        };
        assert_eq!(scancodes[0].position.x, Some(5.0));
        assert_eq!(scancodes[0].position.y, Some(2.0));
    }
}
