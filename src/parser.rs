//! Two-stage KLL parser.
//!
//! Stage one (classification) splits a comment-stripped file into
//! `<lparam> <operator> <rparam> ;` groups using the classifier rules of
//! kll.pest. Stage two re-parses each span with the entry rule matching the
//! operator and produces the typed expression. The locale travels as parser
//! user data so HID names resolve during parsing.

use pest::Parser as PestParser;
use pest_consume::{match_nodes, Error, Parser};
use std::sync::Arc;

use crate::expression::{
    AssignValue, AssignmentExpression, DataAssociation, DataAssociationExpression, Expression,
    MapExpression, NameAssoc, NameAssociationExpression, Operator, PixelChanTarget, Sequence,
};
use crate::layouts::Layout;
use crate::types::{
    AddrVal, AnimationFrameId, AnimationId, AnimationModArg, AnimationModifier,
    AnimationModifierList, CapArg, CapId, CapKind, Channel, ChannelList, HidClass, HidId,
    Identifier, LayerId, LayerKind, ParamState, PixelAddressId, PixelId, PixelLayerId,
    PixelModifier, PixelModifierList, PixelOp, PixelUid, ScanCodeId, ScheduleParam, Time, TimeUnit,
    TriggerId,
};
use log::warn;

pub type PestError = Error<Rule>;
type Result<T> = std::result::Result<T, PestError>;
type Data = Arc<Layout>;
type Node<'i> = pest_consume::Node<'i, Rule, Data>;

#[derive(Parser)]
#[grammar = "kll.pest"]
pub struct KllParser;

/// Parse 0x-prefixed or decimal integers. Callers pass tokens already
/// validated by the grammar.
pub fn parse_int(s: &str) -> usize {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).unwrap()
    } else {
        s.parse::<usize>().unwrap()
    }
}

/// Operator as seen by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOperator {
    /// `=`
    Assign,
    /// `=>`
    NameAssociation,
    /// `<=`
    DataAssociation,
    /// The `:` family, all tokenized/parsed the same way
    Map(Operator),
}

impl RawOperator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "=" => Some(Self::Assign),
            "=>" => Some(Self::NameAssociation),
            "<=" => Some(Self::DataAssociation),
            other => Operator::from_str(other).map(Self::Map),
        }
    }
}

impl std::fmt::Display for RawOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assign => write!(f, "="),
            Self::NameAssociation => write!(f, "=>"),
            Self::DataAssociation => write!(f, "<="),
            Self::Map(op) => write!(f, "{}", op),
        }
    }
}

/// Classified statement: raw spans plus the operator and source location
#[derive(Debug, Clone, PartialEq)]
pub struct RawExpression {
    pub lparam: String,
    pub operator: RawOperator,
    pub rparam: String,
    pub line: usize,
    pub col: usize,
}

impl RawExpression {
    /// Re-construct the original statement
    pub fn regen_str(&self) -> String {
        format!("{} {} {};", self.lparam, self.operator, self.rparam)
    }
}

/// Remove # comments, respecting quoted spans
pub fn strip_comments(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    for line in data.lines() {
        let mut in_dquote = false;
        let mut in_squote = false;
        for ch in line.chars() {
            match ch {
                '#' if !in_dquote && !in_squote => break,
                '"' if !in_squote => in_dquote = !in_dquote,
                '\'' if !in_dquote => in_squote = !in_squote,
                _ => {}
            }
            out.push(ch);
        }
        out.push('\n');
    }
    out
}

/// Stage one: split file data into classified expressions
pub fn classify(data: &str) -> std::result::Result<Vec<RawExpression>, Box<PestError>> {
    let stripped = strip_comments(data);
    let nodes = <KllParser as Parser>::parse(Rule::file, &stripped).map_err(Box::new)?;
    let file = nodes.single().map_err(Box::new)?;

    let mut out = vec![];
    for expr in file.into_children() {
        if expr.as_rule() != Rule::expression {
            continue;
        }
        let (line, col) = expr.as_span().start_pos().line_col();
        let mut lparam = String::new();
        let mut operator = None;
        let mut rparam = String::new();
        for child in expr.into_children() {
            match child.as_rule() {
                Rule::ldata => lparam = child.as_str().trim().to_string(),
                Rule::operator => operator = RawOperator::from_str(child.as_str()),
                Rule::rdata => rparam = child.as_str().trim().to_string(),
                _ => {}
            }
        }
        // The grammar only accepts the known operator set
        let operator = operator.unwrap();
        out.push(RawExpression {
            lparam,
            operator,
            rparam,
            line,
            col,
        });
    }
    Ok(out)
}

/// Expand a sequence of combos of ranges into every combination.
///
/// [[[A,B],[C]]] -> [[[A],[C]]], [[[B],[C]]]
pub fn option_expansion(sequence: &[Vec<Vec<Identifier>>]) -> Vec<Sequence> {
    let mut leaf_sizes = vec![];
    let mut total = 1usize;
    for combo in sequence {
        for range in combo {
            leaf_sizes.push(range.len());
            total *= range.len();
        }
    }

    let mut variants = vec![];
    let mut counters = vec![0usize; leaf_sizes.len()];
    for _ in 0..total {
        let mut variant: Sequence = vec![];
        let mut pos = 0;
        for combo in sequence {
            let mut new_combo = vec![];
            for range in combo {
                new_combo.push(range[counters[pos]].clone());
                pos += 1;
            }
            variant.push(new_combo);
        }
        variants.push(variant);

        for (leaf, counter) in counters.iter_mut().enumerate() {
            *counter += 1;
            if *counter >= leaf_sizes[leaf] {
                *counter = 0;
            } else {
                break;
            }
        }
    }
    variants
}

/// Compose a sequence string into a sequence segment (combos of ranges)
fn compose_sequence(
    locale: &Layout,
    text: &str,
    no_clears: bool,
) -> Option<Vec<Vec<Vec<Identifier>>>> {
    let sequence = locale.compose(text, no_clears)?;
    let mut out = vec![];
    for combo in sequence {
        let mut new_combo = vec![];
        for key in combo {
            let uid = match locale.keyboard_uid(&key) {
                Some(uid) => uid,
                None => {
                    warn!("'{}' composition key is unknown in '{}'", key, locale.name);
                    return None;
                }
            };
            new_combo.push(vec![Identifier::Hid(HidId::new(HidClass::Keyboard, uid))]);
        }
        out.push(new_combo);
    }
    Some(out)
}

/// HID id from a raw prefixed token (U"A", CONS0x1, SYS"Sleep", I2)
fn make_hid(locale: &Layout, class: HidClass, token: &str) -> Identifier {
    let stripped = token
        .strip_prefix(class.kll_prefix())
        .unwrap_or(token)
        .trim();
    let hid = if let Some(name) = stripped.strip_prefix('"') {
        let name = name.trim_end_matches('"');
        match locale.uid(class, name) {
            Some(uid) => HidId::new(class, uid),
            None => {
                warn!(
                    "Unknown HID({:?}) name '{}' in locale '{}'",
                    class, name, locale.name
                );
                HidId::unknown(class)
            }
        }
    } else {
        let uid = parse_int(stripped) as u16;
        if !locale.known_uid(class, uid) {
            warn!(
                "Unknown HID({:?}) uid '{}' in locale '{}'",
                class, uid, locale.name
            );
        }
        HidId::new(class, uid)
    };
    Identifier::Hid(hid)
}

/// HID uid from a bracket item (bare string or number)
fn hid_item_uid(locale: &Layout, class: HidClass, item: &HidItem) -> Option<u16> {
    match item {
        HidItem::Number(n) => Some(*n as u16),
        HidItem::Name(name) => match locale.uid(class, name) {
            Some(uid) => Some(uid),
            None => {
                warn!(
                    "Unknown HID({:?}) name '{}' in locale '{}'",
                    class, name, locale.name
                );
                None
            }
        },
    }
}

#[derive(Debug, Clone)]
enum HidItem {
    Name(String),
    Number(usize),
}

/// Attach a schedule to every member of a range
fn unroll_schedule(mut ids: Vec<Identifier>, spec: Option<Vec<ScheduleParam>>) -> Vec<Identifier> {
    if let Some(spec) = spec {
        for id in &mut ids {
            id.set_schedule(Some(spec.clone()));
        }
    }
    ids
}

/// Expanded HID bracket group for one class
fn hid_group(
    locale: &Layout,
    class: HidClass,
    inners: Vec<(Vec<HidItem>, Option<Vec<ScheduleParam>>, bool)>,
    outer_spec: Option<Vec<ScheduleParam>>,
) -> Vec<Identifier> {
    let mut ids = vec![];
    for (items, spec, is_range) in inners {
        if is_range {
            let mut ends = items
                .iter()
                .filter_map(|item| hid_item_uid(locale, class, item));
            if let (Some(a), Some(b)) = (ends.next(), ends.next()) {
                let (start, end) = if a <= b { (a, b) } else { (b, a) };
                for uid in start..=end {
                    ids.push(Identifier::Hid(HidId::new(class, uid)));
                }
            }
        } else {
            for item in &items {
                match hid_item_uid(locale, class, item) {
                    Some(uid) => {
                        let id = Identifier::Hid(HidId::new(class, uid));
                        ids.extend(unroll_schedule(vec![id], spec.clone()));
                    }
                    None => ids.push(Identifier::Hid(HidId::unknown(class))),
                }
            }
        }
    }
    unroll_schedule(ids, outer_spec)
}

#[pest_consume::parser]
impl KllParser {
    fn EOI(_input: Node) -> Result<()> {
        Ok(())
    }

    fn number(input: Node) -> Result<usize> {
        Ok(parse_int(input.as_str()))
    }

    fn name(input: Node) -> Result<String> {
        Ok(input.as_str().to_string())
    }

    fn string(input: Node) -> Result<String> {
        Ok(input.as_str().trim_matches('"').to_string())
    }

    fn seq_string(input: Node) -> Result<String> {
        Ok(input.as_str().trim_matches('\'').to_string())
    }

    fn dash(_input: Node) -> Result<()> {
        Ok(())
    }

    fn timing(input: Node) -> Result<Time> {
        let text = input.as_str();
        let unit_start = text
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(text.len());
        let value: f64 = text[..unit_start].parse().unwrap_or(0.0);
        let unit = TimeUnit::from_str(&text[unit_start..])
            .ok_or_else(|| input.error("unknown timing unit".to_string()))?;
        Ok(Time::new(value, unit))
    }

    fn percent(input: Node) -> Result<f32> {
        let text = input.as_str().trim_end_matches('%');
        Ok(text.parse::<f32>().unwrap_or(0.0) / 100.0)
    }

    // -- Schedules --

    fn spec_state_timing(input: Node) -> Result<ScheduleParam> {
        Ok(match_nodes!(input.into_children();
            [name(state), timing(time)] => ScheduleParam::new(
                Some(ParamState::Symbol(state)), Some(time)),
        ))
    }

    fn spec_timing(input: Node) -> Result<ScheduleParam> {
        Ok(match_nodes!(input.into_children();
            [timing(time)] => ScheduleParam::new(None, Some(time)),
        ))
    }

    fn spec_state(input: Node) -> Result<ScheduleParam> {
        Ok(match_nodes!(input.into_children();
            [name(state)] => ScheduleParam::new(Some(ParamState::Symbol(state)), None),
        ))
    }

    fn spec_number(input: Node) -> Result<ScheduleParam> {
        Ok(match_nodes!(input.into_children();
            [number(n)] => ScheduleParam::new(Some(ParamState::Number(n as i64)), None),
            [dash(_), number(n)] => ScheduleParam::new(
                Some(ParamState::Number(-(n as i64))), None),
        ))
    }

    fn spec_entry(input: Node) -> Result<ScheduleParam> {
        Ok(match_nodes!(input.into_children();
            [spec_state_timing(p)] => p,
            [spec_timing(p)] => p,
            [spec_state(p)] => p,
            [spec_number(p)] => p,
        ))
    }

    fn spec_list(input: Node) -> Result<Vec<ScheduleParam>> {
        Ok(match_nodes!(input.into_children();
            [spec_entry(entries)..] => entries.collect(),
        ))
    }

    // -- Scan codes --

    fn scancode(input: Node) -> Result<ScanCodeId> {
        Ok(ScanCodeId::new(
            parse_int(input.as_str().strip_prefix('S').unwrap()) as u16,
        ))
    }

    fn num_range(input: Node) -> Result<(usize, usize)> {
        Ok(match_nodes!(input.into_children();
            [number(a), number(b)] => (a, b),
        ))
    }

    fn sc_item(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [number(n)] => vec![Identifier::ScanCode(ScanCodeId::new(n as u16))],
            [number(n), spec_list(spec)] => unroll_schedule(
                vec![Identifier::ScanCode(ScanCodeId::new(n as u16))], Some(spec)),
        ))
    }

    fn sc_inner(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [num_range((a, b))] => {
                let (start, end) = if a <= b { (a, b) } else { (b, a) };
                (start..=end)
                    .map(|uid| Identifier::ScanCode(ScanCodeId::new(uid as u16)))
                    .collect()
            },
            [sc_item(ids)] => ids,
        ))
    }

    fn sc_elem(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [scancode(sc)] => vec![Identifier::ScanCode(sc)],
            [scancode(sc), spec_list(spec)] => unroll_schedule(
                vec![Identifier::ScanCode(sc)], Some(spec)),
        ))
    }

    fn sc_expanded(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [sc_inner(inners)..] => inners.flatten().collect(),
            [sc_inner(inners).., spec_list(spec)] => unroll_schedule(
                inners.flatten().collect(), Some(spec)),
        ))
    }

    // -- HID codes --

    fn usb(input: Node) -> Result<Identifier> {
        let locale = input.user_data().clone();
        Ok(make_hid(&locale, HidClass::Keyboard, input.as_str()))
    }

    fn cons(input: Node) -> Result<Identifier> {
        let locale = input.user_data().clone();
        Ok(make_hid(&locale, HidClass::Consumer, input.as_str()))
    }

    fn sys(input: Node) -> Result<Identifier> {
        let locale = input.user_data().clone();
        Ok(make_hid(&locale, HidClass::System, input.as_str()))
    }

    fn ind(input: Node) -> Result<Identifier> {
        let locale = input.user_data().clone();
        Ok(make_hid(&locale, HidClass::Indicator, input.as_str()))
    }

    fn hid_item(input: Node) -> Result<(Vec<HidItem>, Option<Vec<ScheduleParam>>, bool)> {
        Ok(match_nodes!(input.into_children();
            [string(s)] => (vec![HidItem::Name(s)], None, false),
            [number(n)] => (vec![HidItem::Number(n)], None, false),
            [string(s), spec_list(spec)] => (vec![HidItem::Name(s)], Some(spec), false),
            [number(n), spec_list(spec)] => (vec![HidItem::Number(n)], Some(spec), false),
        ))
    }

    fn hid_range(input: Node) -> Result<(Vec<HidItem>, Option<Vec<ScheduleParam>>, bool)> {
        let mut items = vec![];
        for child in input.into_children() {
            match child.as_rule() {
                Rule::string => items.push(HidItem::Name(Self::string(child)?)),
                Rule::number => items.push(HidItem::Number(Self::number(child)?)),
                _ => {}
            }
        }
        Ok((items, None, true))
    }

    fn hid_inner(input: Node) -> Result<(Vec<HidItem>, Option<Vec<ScheduleParam>>, bool)> {
        Ok(match_nodes!(input.into_children();
            [hid_range(r)] => r,
            [hid_item(i)] => i,
        ))
    }

    fn usb_elem(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [usb(id)] => vec![id],
            [usb(id), spec_list(spec)] => unroll_schedule(vec![id], Some(spec)),
        ))
    }

    fn usb_expanded(input: Node) -> Result<Vec<Identifier>> {
        let locale = input.user_data().clone();
        Ok(match_nodes!(input.into_children();
            [hid_inner(inners)..] =>
                hid_group(&locale, HidClass::Keyboard, inners.collect(), None),
            [hid_inner(inners).., spec_list(spec)] =>
                hid_group(&locale, HidClass::Keyboard, inners.collect(), Some(spec)),
        ))
    }

    fn cons_elem(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [cons(id)] => vec![id],
            [cons(id), spec_list(spec)] => unroll_schedule(vec![id], Some(spec)),
        ))
    }

    fn cons_expanded(input: Node) -> Result<Vec<Identifier>> {
        let locale = input.user_data().clone();
        Ok(match_nodes!(input.into_children();
            [hid_inner(inners)..] =>
                hid_group(&locale, HidClass::Consumer, inners.collect(), None),
            [hid_inner(inners).., spec_list(spec)] =>
                hid_group(&locale, HidClass::Consumer, inners.collect(), Some(spec)),
        ))
    }

    fn sys_elem(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [sys(id)] => vec![id],
            [sys(id), spec_list(spec)] => unroll_schedule(vec![id], Some(spec)),
        ))
    }

    fn sys_expanded(input: Node) -> Result<Vec<Identifier>> {
        let locale = input.user_data().clone();
        Ok(match_nodes!(input.into_children();
            [hid_inner(inners)..] =>
                hid_group(&locale, HidClass::System, inners.collect(), None),
            [hid_inner(inners).., spec_list(spec)] =>
                hid_group(&locale, HidClass::System, inners.collect(), Some(spec)),
        ))
    }

    fn ind_elem(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [ind(id)] => vec![id],
            [ind(id), spec_list(spec)] => unroll_schedule(vec![id], Some(spec)),
        ))
    }

    fn ind_expanded(input: Node) -> Result<Vec<Identifier>> {
        let locale = input.user_data().clone();
        Ok(match_nodes!(input.into_children();
            [hid_inner(inners)..] =>
                hid_group(&locale, HidClass::Indicator, inners.collect(), None),
            [hid_inner(inners).., spec_list(spec)] =>
                hid_group(&locale, HidClass::Indicator, inners.collect(), Some(spec)),
        ))
    }

    // -- Layers --

    fn layer_kind(input: Node) -> Result<LayerKind> {
        LayerKind::from_str(input.as_str())
            .ok_or_else(|| input.error("unknown layer kind".to_string()))
    }

    fn layer_inner(input: Node) -> Result<Vec<usize>> {
        Ok(match_nodes!(input.into_children();
            [num_range((a, b))] => {
                let (start, end) = if a <= b { (a, b) } else { (b, a) };
                (start..=end).collect()
            },
            [number(n)] => vec![n],
        ))
    }

    fn layer_expanded(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [layer_kind(kind), layer_inner(inners)..] => inners
                .flatten()
                .map(|uid| Identifier::Layer(LayerId::new(kind, uid as u16)))
                .collect(),
            [layer_kind(kind), layer_inner(inners).., spec_list(spec)] => unroll_schedule(
                inners
                    .flatten()
                    .map(|uid| Identifier::Layer(LayerId::new(kind, uid as u16)))
                    .collect(),
                Some(spec)),
        ))
    }

    // -- Generic triggers --

    fn gtrigger(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [number(idcode), number(uid)] =>
                vec![Identifier::Generic(TriggerId::new(idcode as u8, uid as u16))],
            [number(idcode), number(uid), spec_list(spec)] => unroll_schedule(
                vec![Identifier::Generic(TriggerId::new(idcode as u8, uid as u16))],
                Some(spec)),
        ))
    }

    // -- Animations --

    fn anim_str(input: Node) -> Result<AnimationId> {
        let name = input.as_str().trim_start_matches('A').trim_matches('"');
        Ok(AnimationId::new(name.trim_matches('"')))
    }

    fn anim_bracket(input: Node) -> Result<AnimationId> {
        Ok(match_nodes!(input.into_children();
            [name(n)] => AnimationId::new(&n),
            [name(n), name(state)] => {
                let mut id = AnimationId::new(&n);
                id.state = Some(state);
                id
            },
        ))
    }

    fn anim_trigger(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [anim_bracket(id)] => vec![Identifier::Animation(id)],
            [anim_str(id)] => vec![Identifier::Animation(id)],
            [anim_bracket(id), spec_list(spec)] => unroll_schedule(
                vec![Identifier::Animation(id)], Some(spec)),
            [anim_str(id), spec_list(spec)] => unroll_schedule(
                vec![Identifier::Animation(id)], Some(spec)),
        ))
    }

    fn anim_mod_call(input: Node) -> Result<AnimationModArg> {
        Ok(match_nodes!(input.into_children();
            [name(n), number(args)..] =>
                AnimationModArg::Call(n, args.map(|a| a as i64).collect()),
        ))
    }

    fn anim_mod_arg(input: Node) -> Result<AnimationModArg> {
        Ok(match_nodes!(input.into_children();
            [number(n)] => AnimationModArg::Number(n as i64),
            [anim_mod_call(c)] => c,
            [name(n)] => AnimationModArg::Name(n),
        ))
    }

    fn anim_mod(input: Node) -> Result<AnimationModifier> {
        Ok(match_nodes!(input.into_children();
            [name(n)] => AnimationModifier::new(&n, AnimationModArg::None),
            [number(n)] => AnimationModifier::new(&n.to_string(), AnimationModArg::None),
            [name(n), anim_mod_arg(arg)] => AnimationModifier::new(&n, arg),
            [number(n), anim_mod_arg(arg)] => AnimationModifier::new(&n.to_string(), arg),
        ))
    }

    fn anim_mods(input: Node) -> Result<Vec<AnimationModifier>> {
        Ok(match_nodes!(input.into_children();
            [anim_mod(mods)..] => mods.collect(),
        ))
    }

    fn anim_result(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [anim_bracket(id)] => vec![Identifier::Animation(id)],
            [anim_str(id)] => vec![Identifier::Animation(id)],
            [anim_bracket(id), anim_mods(mods)] => {
                let mut id = id;
                id.modifiers.set_modifiers(mods);
                vec![Identifier::Animation(id)]
            },
            [anim_str(id), anim_mods(mods)] => {
                let mut id = id;
                id.modifiers.set_modifiers(mods);
                vec![Identifier::Animation(id)]
            },
        ))
    }

    // -- Pixels --

    fn pixel(input: Node) -> Result<PixelId> {
        Ok(PixelId::from_index(parse_int(
            input.as_str().strip_prefix('P').unwrap(),
        )))
    }

    fn pixellayer(input: Node) -> Result<PixelLayerId> {
        Ok(PixelLayerId {
            uid: parse_int(input.as_str().strip_prefix("PL").unwrap()) as u16,
            modifiers: PixelModifierList::default(),
        })
    }

    fn rel_op(input: Node) -> Result<String> {
        Ok(input.as_str().to_string())
    }

    fn cr_op(input: Node) -> Result<String> {
        Ok(input.as_str().to_string())
    }

    fn addr_value(input: Node) -> Result<AddrVal> {
        Ok(match_nodes!(input.into_children();
            [percent(p)] => AddrVal::Percent(p),
            [number(n)] => AddrVal::Num(n as i32),
            [dash(_), number(n)] => AddrVal::Num(-(n as i32)),
        ))
    }

    fn pixel_rel(input: Node) -> Result<PixelAddressId> {
        let (op, value) = match_nodes!(input.into_children();
            [rel_op(op)] => (op, AddrVal::Num(0)),
            [rel_op(op), addr_value(v)] => (op, v),
        );
        let value = if op.contains('-') {
            match value {
                AddrVal::Num(n) => AddrVal::Num(-n),
                AddrVal::Percent(p) => AddrVal::Percent(-p),
            }
        } else {
            value
        };
        let mut addr = PixelAddressId::default();
        if op.starts_with('r') {
            addr.rel_row = Some(value);
        } else {
            addr.rel_col = Some(value);
        }
        Ok(addr)
    }

    fn pixel_colrow(input: Node) -> Result<PixelAddressId> {
        let (op, value) = match_nodes!(input.into_children();
            [cr_op(op), addr_value(v)] => (op, v),
        );
        let mut addr = PixelAddressId::default();
        if op.starts_with('r') {
            addr.row = Some(value);
        } else {
            addr.col = Some(value);
        }
        Ok(addr)
    }

    fn pixel_addr_item(input: Node) -> Result<Vec<PixelAddressId>> {
        Ok(match_nodes!(input.into_children();
            [num_range((a, b))] => {
                let (start, end) = if a <= b { (a, b) } else { (b, a) };
                (start..=end).map(PixelAddressId::from_index).collect()
            },
            [pixel_rel(addr)] => vec![addr],
            [pixel_colrow(addr)] => vec![addr],
            [number(n)] => vec![PixelAddressId::from_index(n)],
        ))
    }

    fn pixel_expanded(input: Node) -> Result<Vec<PixelId>> {
        let items: Vec<Vec<PixelAddressId>> = match_nodes!(input.into_children();
            [pixel_addr_item(items)..] => items.collect(),
        );

        // Index items each name a pixel; positional items merge into one
        // combined address
        let mut pixels = vec![];
        let mut positional: Option<PixelAddressId> = None;
        for addr in items.into_iter().flatten() {
            if addr.index.is_some() {
                pixels.push(PixelId::from_address(addr));
            } else {
                match &mut positional {
                    None => positional = Some(addr),
                    Some(merged) => {
                        if let Err(err) = merged.merge(&addr) {
                            warn!("{}", err);
                        }
                    }
                }
            }
        }
        if let Some(addr) = positional {
            pixels.push(PixelId::from_address(addr));
        }
        Ok(pixels)
    }

    fn pixel_elem(input: Node) -> Result<Vec<PixelId>> {
        Ok(match_nodes!(input.into_children();
            [pixel(p)] => vec![p],
        ))
    }

    fn chan_entry(input: Node) -> Result<Channel> {
        Ok(match_nodes!(input.into_children();
            [number(uid), number(width)] => Channel {
                uid: uid as u32,
                width: width as u8,
            },
        ))
    }

    fn sc_single(input: Node) -> Result<ScanCodeId> {
        Ok(match_nodes!(input.into_children();
            [scancode(sc)] => sc,
            [number(n)] => ScanCodeId::new(n as u16),
        ))
    }

    fn pixelchan_lhs(input: Node) -> Result<PixelId> {
        let (mut pixels, channels): (Vec<PixelId>, Vec<Channel>) =
            match_nodes!(input.into_children();
                [pixel_expanded(p), chan_entry(chans).., _] => (p, chans.collect()),
                [pixel_elem(p), chan_entry(chans).., _] => (p, chans.collect()),
            );
        // Only one pixel per channel mapping
        let mut pixel = pixels.remove(0);
        pixel.channels = ChannelList { channels };
        Ok(pixel)
    }

    fn pixelchan_rhs(input: Node) -> Result<PixelChanTarget> {
        Ok(match_nodes!(input.into_children();
            [sc_single(sc), _] => PixelChanTarget::Scan(sc),
            [none_kw(_), _] => PixelChanTarget::None,
        ))
    }

    fn none_kw(_input: Node) -> Result<()> {
        Ok(())
    }

    fn pixel_mod_op(input: Node) -> Result<PixelOp> {
        PixelOp::from_str(input.as_str())
            .ok_or_else(|| input.error("unknown pixel operator".to_string()))
    }

    fn pixel_mod(input: Node) -> Result<PixelModifier> {
        Ok(match_nodes!(input.into_children();
            [number(n)] => PixelModifier { operator: None, value: n as i64 },
            [pixel_mod_op(op), number(n)] => PixelModifier {
                operator: Some(op),
                value: n as i64,
            },
        ))
    }

    fn pixel_mods(input: Node) -> Result<Vec<PixelModifier>> {
        Ok(match_nodes!(input.into_children();
            [pixel_mod(mods)..] => mods.collect(),
        ))
    }

    fn pl_expanded(input: Node) -> Result<Vec<PixelLayerId>> {
        Ok(match_nodes!(input.into_children();
            [layer_inner(inners)..] => inners
                .flatten()
                .map(|uid| PixelLayerId {
                    uid: uid as u16,
                    modifiers: PixelModifierList::default(),
                })
                .collect(),
        ))
    }

    fn pl_elem(input: Node) -> Result<Vec<PixelLayerId>> {
        Ok(match_nodes!(input.into_children();
            [pixellayer(pl)] => vec![pl],
        ))
    }

    fn pixel_target(input: Node) -> Result<Vec<Identifier>> {
        let child = input.into_children().single()?;
        Ok(match child.as_rule() {
            Rule::pixel_expanded => Self::pixel_expanded(child)?
                .into_iter()
                .map(Identifier::Pixel)
                .collect(),
            Rule::pixel_elem => Self::pixel_elem(child)?
                .into_iter()
                .map(Identifier::Pixel)
                .collect(),
            Rule::sc_elem => Self::sc_elem(child)?,
            Rule::usb_elem => Self::usb_elem(child)?,
            Rule::cons_elem => Self::cons_elem(child)?,
            Rule::sys_elem => Self::sys_elem(child)?,
            Rule::ind_elem => Self::ind_elem(child)?,
            Rule::pl_expanded => Self::pl_expanded(child)?
                .into_iter()
                .map(Identifier::PixelLayer)
                .collect(),
            Rule::pl_elem => Self::pl_elem(child)?
                .into_iter()
                .map(Identifier::PixelLayer)
                .collect(),
            _ => return Err(child.error("unexpected pixel target".to_string())),
        })
    }

    fn pixel_value(input: Node) -> Result<Vec<Identifier>> {
        let (targets, mods) = match_nodes!(input.into_children();
            [pixel_target(targets), pixel_mods(mods)] => (targets, mods),
        );
        let modifiers = PixelModifierList { modifiers: mods };
        let mut out = vec![];
        for target in targets {
            match target {
                // HID/scan targets become pixels addressed by that code
                Identifier::Pixel(mut pixel) => {
                    pixel.modifiers = modifiers.clone();
                    out.push(Identifier::Pixel(pixel));
                }
                Identifier::ScanCode(sc) => {
                    out.push(Identifier::Pixel(PixelId {
                        uid: PixelUid::Scan(sc),
                        modifiers: modifiers.clone(),
                        channels: ChannelList::default(),
                        position: Default::default(),
                    }));
                }
                Identifier::Hid(hid) => {
                    out.push(Identifier::Pixel(PixelId {
                        uid: PixelUid::Hid(hid),
                        modifiers: modifiers.clone(),
                        channels: ChannelList::default(),
                        position: Default::default(),
                    }));
                }
                Identifier::PixelLayer(mut pl) => {
                    pl.modifiers = modifiers.clone();
                    out.push(Identifier::PixelLayer(pl));
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    // -- Capabilities --

    fn cap_arg(input: Node) -> Result<i64> {
        Ok(match_nodes!(input.into_children();
            [number(n)] => n as i64,
            [dash(_), number(n)] => -(n as i64),
        ))
    }

    fn cap_call(input: Node) -> Result<Vec<Identifier>> {
        Ok(match_nodes!(input.into_children();
            [name(n), cap_arg(args)..] => vec![Identifier::Capability(CapId::new(
                &n,
                CapKind::Capability,
                args.map(CapArg::Value).collect(),
            ))],
            [name(n), cap_arg(args).., spec_list(spec)] => unroll_schedule(
                vec![Identifier::Capability(CapId::new(
                    &n,
                    CapKind::Capability,
                    args.map(CapArg::Value).collect(),
                ))],
                Some(spec)),
        ))
    }

    fn utf8_str(input: Node) -> Result<Identifier> {
        let text = input.as_str().trim_start_matches('u').trim_matches('"');
        Ok(Identifier::Utf8(crate::types::Utf8Id {
            text: text.to_string(),
            schedule: Default::default(),
        }))
    }

    // -- Mapping sides --

    fn trigger_elem(input: Node) -> Result<Vec<Identifier>> {
        let child = input.into_children().single()?;
        Ok(match child.as_rule() {
            Rule::sys_expanded => Self::sys_expanded(child)?,
            Rule::sys_elem => Self::sys_elem(child)?,
            Rule::cons_expanded => Self::cons_expanded(child)?,
            Rule::cons_elem => Self::cons_elem(child)?,
            Rule::usb_expanded => Self::usb_expanded(child)?,
            Rule::usb_elem => Self::usb_elem(child)?,
            Rule::ind_expanded => Self::ind_expanded(child)?,
            Rule::ind_elem => Self::ind_elem(child)?,
            Rule::sc_expanded => Self::sc_expanded(child)?,
            Rule::sc_elem => Self::sc_elem(child)?,
            Rule::layer_expanded => Self::layer_expanded(child)?,
            Rule::gtrigger => Self::gtrigger(child)?,
            Rule::anim_trigger => Self::anim_trigger(child)?,
            _ => return Err(child.error("unexpected trigger element".to_string())),
        })
    }

    fn trigger_combo(input: Node) -> Result<Vec<Vec<Identifier>>> {
        Ok(match_nodes!(input.into_children();
            [trigger_elem(elems)..] => elems.collect(),
        ))
    }

    fn trigger_group(input: Node) -> Result<Vec<Vec<Vec<Identifier>>>> {
        let locale = input.user_data().clone();
        let err = input.clone();
        Ok(match_nodes!(input.into_children();
            [trigger_combo(combo)] => vec![combo],
            [seq_string(text)] => compose_sequence(&locale, &text, true)
                .ok_or_else(|| err.error("sequence string failed to compose".to_string()))?,
        ))
    }

    fn trigger_lhs(input: Node) -> Result<Vec<Sequence>> {
        let sequence: Vec<Vec<Vec<Identifier>>> = match_nodes!(input.into_children();
            [trigger_group(groups).., _] => groups.flatten().collect(),
        );
        Ok(option_expansion(&sequence))
    }

    fn result_elem(input: Node) -> Result<Vec<Identifier>> {
        let child = input.into_children().single()?;
        Ok(match child.as_rule() {
            Rule::sys_expanded => Self::sys_expanded(child)?,
            Rule::sys_elem => Self::sys_elem(child)?,
            Rule::cons_expanded => Self::cons_expanded(child)?,
            Rule::cons_elem => Self::cons_elem(child)?,
            Rule::usb_expanded => Self::usb_expanded(child)?,
            Rule::usb_elem => Self::usb_elem(child)?,
            Rule::ind_expanded => Self::ind_expanded(child)?,
            Rule::ind_elem => Self::ind_elem(child)?,
            Rule::layer_expanded => Self::layer_expanded(child)?,
            Rule::anim_result => Self::anim_result(child)?,
            Rule::pixel_value => Self::pixel_value(child)?,
            Rule::utf8_str => vec![Self::utf8_str(child)?],
            Rule::cap_call => Self::cap_call(child)?,
            _ => return Err(child.error("unexpected result element".to_string())),
        })
    }

    fn result_combo(input: Node) -> Result<Vec<Vec<Identifier>>> {
        Ok(match_nodes!(input.into_children();
            [result_elem(elems)..] => elems.collect(),
        ))
    }

    fn result_group(input: Node) -> Result<Vec<Vec<Vec<Identifier>>>> {
        let locale = input.user_data().clone();
        let err = input.clone();
        Ok(match_nodes!(input.into_children();
            [result_combo(combo)] => vec![combo],
            [seq_string(text)] => compose_sequence(&locale, &text, false)
                .ok_or_else(|| err.error("sequence string failed to compose".to_string()))?,
        ))
    }

    fn result_rhs(input: Node) -> Result<Vec<Sequence>> {
        Ok(match_nodes!(input.into_children();
            [none_kw(_), _] => vec![vec![vec![Identifier::None]]],
            [result_group(groups).., _] => {
                let sequence: Vec<Vec<Vec<Identifier>>> = groups.flatten().collect();
                option_expansion(&sequence)
            },
        ))
    }

    // -- Assignment --

    fn assign_name(input: Node) -> Result<String> {
        Ok(match_nodes!(input.into_children();
            [string(s)] => s,
            [name(n)] => n,
        ))
    }

    fn array_index(input: Node) -> Result<Option<usize>> {
        Ok(match_nodes!(input.into_children();
            [] => None,
            [number(n)] => Some(n),
        ))
    }

    fn assignment_lhs(input: Node) -> Result<(String, Option<Option<usize>>)> {
        Ok(match_nodes!(input.into_children();
            [assign_name(name), _] => (name, None),
            [assign_name(name), array_index(index), _] => (name, Some(index)),
        ))
    }

    fn assign_value(input: Node) -> Result<String> {
        let child = input.into_children().single()?;
        Ok(match child.as_rule() {
            Rule::string => Self::string(child)?,
            Rule::seq_string => Self::seq_string(child)?,
            Rule::var_content => child.as_str().to_string(),
            _ => return Err(child.error("unexpected assignment value".to_string())),
        })
    }

    fn assignment_rhs(input: Node) -> Result<Vec<String>> {
        Ok(match_nodes!(input.into_children();
            [assign_value(values).., _] => values.collect(),
        ))
    }

    // -- Name association --

    fn nameassoc_lhs(input: Node) -> Result<String> {
        Ok(match_nodes!(input.into_children();
            [name(n), _] => n,
        ))
    }

    fn cap_arg_def(input: Node) -> Result<CapArg> {
        Ok(match_nodes!(input.into_children();
            [name(n), number(width)] => CapArg::Def {
                name: n,
                width: Some(width),
            },
        ))
    }

    fn cap_def(input: Node) -> Result<CapId> {
        Ok(match_nodes!(input.into_children();
            [name(n), cap_arg_def(args)..] =>
                CapId::new(&n, CapKind::Definition, args.collect()),
        ))
    }

    fn nameassoc_rhs(input: Node) -> Result<NameAssoc> {
        Ok(match_nodes!(input.into_children();
            [cap_def(cap), _] => NameAssoc::Capability(cap),
            [name(n), _] => NameAssoc::Define(n),
        ))
    }

    // -- Data association --

    fn frame_index(input: Node) -> Result<Vec<usize>> {
        Ok(match_nodes!(input.into_children();
            [num_range((a, b))] => {
                let (start, end) = if a <= b { (a, b) } else { (b, a) };
                (start..=end).collect()
            },
            [number(n)] => vec![n],
        ))
    }

    fn anim_frame_lhs(input: Node) -> Result<(String, Vec<usize>)> {
        Ok(match_nodes!(input.into_children();
            [name(n), frame_index(indices).., _] =>
                (n, indices.flatten().collect()),
        ))
    }

    fn anim_def_lhs(input: Node) -> Result<AnimationId> {
        Ok(match_nodes!(input.into_children();
            [anim_bracket(id), _] => id,
            [anim_str(id), _] => id,
        ))
    }

    fn pixel_pos_lhs(input: Node) -> Result<Vec<PixelId>> {
        Ok(match_nodes!(input.into_children();
            [pixel_expanded(pixels), _] => pixels,
            [pixel_elem(pixels), _] => pixels,
        ))
    }

    fn scancode_pos_lhs(input: Node) -> Result<Vec<ScanCodeId>> {
        let mut scancodes = vec![];
        for child in input.into_children() {
            let ids = match child.as_rule() {
                Rule::sc_expanded => Self::sc_expanded(child)?,
                Rule::sc_elem => Self::sc_elem(child)?,
                Rule::EOI => continue,
                _ => return Err(child.error("unexpected scan code".to_string())),
            };
            for id in ids {
                if let Identifier::ScanCode(sc) = id {
                    scancodes.push(sc);
                }
            }
        }
        Ok(scancodes)
    }

    fn pos_axis(input: Node) -> Result<String> {
        Ok(input.as_str().to_string())
    }

    fn pos_value(input: Node) -> Result<f32> {
        Ok(input.as_str().parse::<f32>().unwrap_or(0.0))
    }

    fn position_item(input: Node) -> Result<(String, f32)> {
        Ok(match_nodes!(input.into_children();
            [pos_axis(axis), pos_value(value)] => (axis, value),
        ))
    }

    fn position_rhs(input: Node) -> Result<Vec<(String, f32)>> {
        Ok(match_nodes!(input.into_children();
            [position_item(items).., _] => items.collect(),
        ))
    }

    fn animmod_rhs(input: Node) -> Result<AnimationModifierList> {
        Ok(match_nodes!(input.into_children();
            [anim_mod(mods).., _] => {
                let mut list = AnimationModifierList::default();
                list.set_modifiers(mods.collect());
                list
            },
        ))
    }

    fn frame_rhs(input: Node) -> Result<Vec<PixelId>> {
        let values: Vec<Vec<Identifier>> = match_nodes!(input.into_children();
            [pixel_value(values).., _] => values.collect(),
        );
        let mut pixels = vec![];
        for id in values.into_iter().flatten() {
            match id {
                Identifier::Pixel(pixel) => pixels.push(pixel),
                other => warn!("'{}' cannot appear in an animation frame", other),
            }
        }
        Ok(pixels)
    }
}

/// Parse a span with the given entry rule
fn parse_rule<'i>(rule: Rule, input: &'i str, locale: &Data) -> Result<Node<'i>> {
    let nodes = KllParser::parse_with_userdata(rule, input, locale.clone())?;
    nodes.single()
}

fn parse_assignment(raw: &RawExpression, locale: &Data) -> Result<Expression> {
    let lhs = KllParser::assignment_lhs(parse_rule(Rule::assignment_lhs, &raw.lparam, locale)?)?;
    let values =
        KllParser::assignment_rhs(parse_rule(Rule::assignment_rhs, &raw.rparam, locale)?)?;
    let (name, index) = lhs;
    Ok(Expression::Assignment(match index {
        // <name> = <contents>
        None => AssignmentExpression::variable(&name, values.concat()),
        // <name>[] = <space separated list>
        Some(None) => AssignmentExpression::array(&name, None, AssignValue::List(values)),
        // <name>[<index>] = <element>
        Some(Some(pos)) => {
            AssignmentExpression::array(&name, Some(pos), AssignValue::Single(values.concat()))
        }
    }))
}

fn parse_name_association(raw: &RawExpression, locale: &Data) -> Result<Expression> {
    let name = KllParser::nameassoc_lhs(parse_rule(Rule::nameassoc_lhs, &raw.lparam, locale)?)?;
    let association =
        KllParser::nameassoc_rhs(parse_rule(Rule::nameassoc_rhs, &raw.rparam, locale)?)?;
    Ok(Expression::NameAssociation(NameAssociationExpression {
        name,
        association,
    }))
}

fn parse_data_association(raw: &RawExpression, locale: &Data) -> Result<Expression> {
    // A[name, indices] <= frame contents
    if let Ok(node) = parse_rule(Rule::anim_frame_lhs, &raw.lparam, locale) {
        let (name, indices) = KllParser::anim_frame_lhs(node)?;
        let pixels = KllParser::frame_rhs(parse_rule(Rule::frame_rhs, &raw.rparam, locale)?)?;
        let frames = indices
            .into_iter()
            .map(|index| AnimationFrameId {
                name: name.clone(),
                index,
            })
            .collect();
        return Ok(Expression::DataAssociation(DataAssociationExpression {
            association: DataAssociation::AnimationFrame { frames, pixels },
        }));
    }

    // A[name] <= default modifiers
    if let Ok(node) = parse_rule(Rule::anim_def_lhs, &raw.lparam, locale) {
        let animation = KllParser::anim_def_lhs(node)?;
        let modifiers =
            KllParser::animmod_rhs(parse_rule(Rule::animmod_rhs, &raw.rparam, locale)?)?;
        return Ok(Expression::DataAssociation(DataAssociationExpression {
            association: DataAssociation::Animation {
                animation,
                modifiers,
            },
        }));
    }

    // P[...] <= physical position
    if let Ok(node) = parse_rule(Rule::pixel_pos_lhs, &raw.lparam, locale) {
        let mut pixels = KllParser::pixel_pos_lhs(node)?;
        let position =
            KllParser::position_rhs(parse_rule(Rule::position_rhs, &raw.rparam, locale)?)?;
        for pixel in &mut pixels {
            pixel.position.set_position(&position);
        }
        return Ok(Expression::DataAssociation(DataAssociationExpression {
            association: DataAssociation::PixelPosition { pixels },
        }));
    }

    // S... <= physical position
    let node = parse_rule(Rule::scancode_pos_lhs, &raw.lparam, locale)?;
    let mut scancodes = KllParser::scancode_pos_lhs(node)?;
    let position = KllParser::position_rhs(parse_rule(Rule::position_rhs, &raw.rparam, locale)?)?;
    for scancode in &mut scancodes {
        scancode.position.set_position(&position);
    }
    Ok(Expression::DataAssociation(DataAssociationExpression {
        association: DataAssociation::ScanCodePosition { scancodes },
    }))
}

fn parse_mapping(raw: &RawExpression, operator: Operator, locale: &Data) -> Result<Expression> {
    // Trigger mapping first, pixel channel composition as the fallback
    let trigger = parse_rule(Rule::trigger_lhs, &raw.lparam, locale)
        .and_then(KllParser::trigger_lhs);
    match trigger {
        Ok(triggers) => {
            let results =
                KllParser::result_rhs(parse_rule(Rule::result_rhs, &raw.rparam, locale)?)?;
            Ok(Expression::Map(MapExpression::trigger_code(
                triggers, operator, results,
            )))
        }
        Err(trigger_err) => {
            let pixel = parse_rule(Rule::pixelchan_lhs, &raw.lparam, locale)
                .and_then(KllParser::pixelchan_lhs);
            match pixel {
                Ok(pixel) if operator == Operator::Set => {
                    let target = KllParser::pixelchan_rhs(parse_rule(
                        Rule::pixelchan_rhs,
                        &raw.rparam,
                        locale,
                    )?)?;
                    Ok(Expression::Map(MapExpression::pixel_channel(pixel, target)))
                }
                _ => Err(trigger_err),
            }
        }
    }
}

/// Stage two: dispatch a classified expression to its operator-specific
/// parser
pub fn parse_raw(raw: &RawExpression, locale: &Data) -> Result<Expression> {
    match raw.operator {
        RawOperator::Assign => parse_assignment(raw, locale),
        RawOperator::NameAssociation => parse_name_association(raw, locale),
        RawOperator::DataAssociation => parse_data_association(raw, locale),
        RawOperator::Map(operator) => parse_mapping(raw, operator, locale),
    }
}

// The raw pest parser, for failure re-runs that want the token trees
// rather than the consumed values
type TraceParser = <KllParser as Parser>::Parser;

/// Re-run a failed expression against every entry rule its operator can
/// use and capture the attempts verbatim. Sides that still match
/// pretty-print their token tree, sides that fail keep the full pest
/// error with its expected-rule listing. Only invoked post-failure.
pub fn parse_trace(raw: &RawExpression) -> String {
    let attempts: Vec<(Rule, &str)> = match raw.operator {
        RawOperator::Assign => vec![
            (Rule::assignment_lhs, raw.lparam.as_str()),
            (Rule::assignment_rhs, raw.rparam.as_str()),
        ],
        RawOperator::NameAssociation => vec![
            (Rule::nameassoc_lhs, raw.lparam.as_str()),
            (Rule::nameassoc_rhs, raw.rparam.as_str()),
        ],
        RawOperator::DataAssociation => vec![
            (Rule::anim_frame_lhs, raw.lparam.as_str()),
            (Rule::anim_def_lhs, raw.lparam.as_str()),
            (Rule::pixel_pos_lhs, raw.lparam.as_str()),
            (Rule::scancode_pos_lhs, raw.lparam.as_str()),
            (Rule::frame_rhs, raw.rparam.as_str()),
            (Rule::animmod_rhs, raw.rparam.as_str()),
            (Rule::position_rhs, raw.rparam.as_str()),
        ],
        RawOperator::Map(_) => vec![
            (Rule::trigger_lhs, raw.lparam.as_str()),
            (Rule::pixelchan_lhs, raw.lparam.as_str()),
            (Rule::result_rhs, raw.rparam.as_str()),
            (Rule::pixelchan_rhs, raw.rparam.as_str()),
        ],
    };

    let mut trail = String::new();
    for (rule, input) in attempts {
        trail += &format!("{:?} <- '{}'\n", rule, input);
        match <TraceParser as PestParser<Rule>>::parse(rule, input) {
            Ok(pairs) => {
                trail += &pairs.to_json();
                trail += "\n";
            }
            Err(err) => {
                trail += &format!("{}\n", err);
            }
        }
    }
    trail
}

/// Parse a whole file worth of text against a locale. Convenience used by
/// tests and simple embeddings.
pub fn parse_string(
    data: &str,
    locale: &Data,
) -> std::result::Result<Vec<Expression>, Box<PestError>> {
    let raws = classify(data)?;
    let mut out = vec![];
    for raw in raws {
        out.push(parse_raw(&raw, locale).map_err(Box::new)?);
    }
    Ok(out)
}
