//! Numbered chat menu as a finite-state machine.
//!
//! [`transition`] is the only place the menu moves. It applies in-memory
//! configuration edits directly and hands anything that needs the broker back
//! to the caller as a [`MenuAction`].

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::Holding;
use crate::trading::{ConfigStore, GlobalSetting, OrderStyle, ThresholdField};

/// Preset choices for take-profit and buy ratio.
const PERCENT_PRESETS: [Decimal; 5] = [dec!(3), dec!(5), dec!(7), dec!(10), dec!(15)];

/// Preset choices for stop-loss magnitude.
const STOP_LOSS_PRESETS: [Decimal; 5] = [dec!(1), dec!(2), dec!(3), dec!(5), dec!(7)];

/// Option that switches a value prompt to free entry.
const DIRECT_ENTRY: &str = "6";

/// Which preset table a value prompt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Percent,
    StopLoss,
}

impl ValueKind {
    fn presets(self) -> &'static [Decimal; 5] {
        match self {
            ValueKind::Percent => &PERCENT_PRESETS,
            ValueKind::StopLoss => &STOP_LOSS_PRESETS,
        }
    }
}

/// Global percentages editable through a value prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentSetting {
    BuyRatio,
    TakeProfit,
    StopLoss,
}

impl PercentSetting {
    fn label(self) -> &'static str {
        match self {
            PercentSetting::BuyRatio => "Buy ratio",
            PercentSetting::TakeProfit => "Take-profit",
            PercentSetting::StopLoss => "Stop-loss",
        }
    }

    fn kind(self) -> ValueKind {
        match self {
            PercentSetting::StopLoss => ValueKind::StopLoss,
            _ => ValueKind::Percent,
        }
    }
}

/// Where an operator is in the menu.
#[derive(Debug, Clone, PartialEq)]
pub enum MenuState {
    Closed,
    Main,
    Holdings {
        holdings: Vec<Holding>,
    },
    StockDetail {
        holdings: Vec<Holding>,
        selected: Holding,
    },
    EditOverride {
        holdings: Vec<Holding>,
        selected: Holding,
        field: ThresholdField,
        direct: bool,
    },
    ConfirmSell {
        holdings: Vec<Holding>,
        selected: Holding,
    },
    NewBuySettings,
    GlobalSettings,
    Status,
    EditPercent {
        setting: PercentSetting,
        direct: bool,
    },
    OrderStyle,
    Condition,
    MaxPositions,
    MinAmount,
}

/// Work the caller must do against the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum MenuAction {
    /// Fetch holdings, then continue with [`enter_holdings`]
    LoadHoldings,
    /// Market-sell the full position, then return to the main menu
    Sell(Holding),
}

/// Result of one input.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next: MenuState,
    pub replies: Vec<String>,
    pub action: Option<MenuAction>,
}

impl Step {
    fn reply(next: MenuState, text: impl Into<String>) -> Self {
        Self {
            next,
            replies: vec![text.into()],
            action: None,
        }
    }

    fn replies(next: MenuState, replies: Vec<String>) -> Self {
        Self {
            next,
            replies,
            action: None,
        }
    }

    fn action(next: MenuState, action: MenuAction) -> Self {
        Self {
            next,
            replies: Vec::new(),
            action: Some(action),
        }
    }
}

/// Interpret a value prompt answer: a preset number or a percentage in 0.1..=50.
///
/// `%`, `+`, `-` and spaces are ignored, so `-3%` and `3` are the same answer.
pub fn parse_value_input(text: &str, kind: ValueKind) -> Option<Decimal> {
    let cleaned = clean_value(text);
    if let Some(preset) = preset(&cleaned, kind) {
        return Some(preset);
    }
    parse_direct(&cleaned)
}

fn clean_value(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '%' | '％') && !c.is_whitespace())
        .collect();
    stripped.trim_start_matches(['-', '+']).to_string()
}

fn preset(cleaned: &str, kind: ValueKind) -> Option<Decimal> {
    let index: usize = cleaned.parse().ok()?;
    kind.presets().get(index.checked_sub(1)?).copied()
}

fn parse_direct(cleaned: &str) -> Option<Decimal> {
    let value = Decimal::from_str(cleaned).ok()?;
    (dec!(0.1)..=dec!(50)).contains(&value).then_some(value)
}

/// Open the holdings list.
pub fn enter_holdings(holdings: Vec<Holding>) -> Step {
    let text = render_holdings(&holdings);
    Step::reply(MenuState::Holdings { holdings }, text)
}

/// Advance the menu by one operator input.
pub fn transition(state: MenuState, input: &str, config: &ConfigStore) -> Step {
    let input = input.trim();

    match state {
        MenuState::Closed => Step::reply(MenuState::Closed, "Send /m to open the menu."),

        MenuState::Main => match input {
            "0" => Step::reply(MenuState::Closed, "Menu closed."),
            "1" => Step::action(MenuState::Main, MenuAction::LoadHoldings),
            "2" => Step::reply(MenuState::NewBuySettings, render_new_buy(config)),
            "3" => Step::reply(MenuState::GlobalSettings, render_global(config)),
            "4" => Step::reply(
                MenuState::Status,
                format!("{}\n0. Back", config.summary()),
            ),
            _ => Step::reply(MenuState::Main, invalid(&render_main())),
        },

        MenuState::Holdings { holdings } => {
            if input == "0" {
                return Step::reply(MenuState::Main, render_main());
            }
            let Ok(index) = input.parse::<usize>() else {
                return Step::reply(MenuState::Holdings { holdings }, "Please enter a number.");
            };
            match index.checked_sub(1).and_then(|i| holdings.get(i)).cloned() {
                Some(selected) => {
                    let text = render_stock_detail(&selected, config);
                    Step::reply(MenuState::StockDetail { holdings, selected }, text)
                }
                None => Step::reply(MenuState::Holdings { holdings }, "No such holding."),
            }
        }

        MenuState::StockDetail { holdings, selected } => {
            let effective = config.get_effective(&selected.symbol);
            match input {
                "0" => enter_holdings(holdings),
                "1" => {
                    let text = render_value_select(
                        "Take-profit",
                        effective.take_profit,
                        ValueKind::Percent,
                    );
                    Step::reply(
                        MenuState::EditOverride {
                            holdings,
                            selected,
                            field: ThresholdField::TakeProfit,
                            direct: false,
                        },
                        text,
                    )
                }
                "2" => {
                    let text = render_value_select(
                        "Stop-loss",
                        effective.stop_loss.abs(),
                        ValueKind::StopLoss,
                    );
                    Step::reply(
                        MenuState::EditOverride {
                            holdings,
                            selected,
                            field: ThresholdField::StopLoss,
                            direct: false,
                        },
                        text,
                    )
                }
                "3" => {
                    let text = format!(
                        "Market sell {} {} shares\n\n1. Confirm\n0. Cancel\n\nEnter a number:",
                        selected.name, selected.quantity
                    );
                    Step::reply(MenuState::ConfirmSell { holdings, selected }, text)
                }
                _ => Step::reply(MenuState::StockDetail { holdings, selected }, "Invalid input."),
            }
        }

        MenuState::ConfirmSell { holdings, selected } => {
            if input == "1" {
                Step::action(MenuState::Main, MenuAction::Sell(selected))
            } else {
                let text = render_stock_detail(&selected, config);
                Step::reply(MenuState::StockDetail { holdings, selected }, text)
            }
        }

        MenuState::EditOverride {
            holdings,
            selected,
            field,
            direct,
        } => {
            if !direct && input == DIRECT_ENTRY {
                let text = format!("Enter the {} % directly (e.g. 8):", field);
                return Step::reply(
                    MenuState::EditOverride {
                        holdings,
                        selected,
                        field,
                        direct: true,
                    },
                    text,
                );
            }

            let kind = match field {
                ThresholdField::TakeProfit => ValueKind::Percent,
                ThresholdField::StopLoss => ValueKind::StopLoss,
            };
            let parsed = if direct {
                parse_direct(&clean_value(input))
            } else {
                parse_value_input(input, kind)
            };
            let retry = MenuState::EditOverride {
                holdings: holdings.clone(),
                selected: selected.clone(),
                field,
                direct,
            };
            let Some(value) = parsed else {
                return Step::reply(retry, "Invalid input. Enter 1-5 or a value between 0.1 and 50.");
            };

            let value = signed(field == ThresholdField::StopLoss, value);
            match config.set_override(&selected.symbol, field, value) {
                Ok(()) => {
                    let confirm = format!(
                        "{} {} set to {}%.",
                        selected.name,
                        field,
                        signed_label(value)
                    );
                    let detail = render_stock_detail(&selected, config);
                    Step::replies(
                        MenuState::StockDetail { holdings, selected },
                        vec![confirm, detail],
                    )
                }
                Err(e) => Step::reply(retry, format!("Rejected: {}", e)),
            }
        }

        MenuState::NewBuySettings => match input {
            "0" => Step::reply(MenuState::Main, render_main()),
            "1" => edit_percent(PercentSetting::BuyRatio, config),
            "2" => edit_percent(PercentSetting::TakeProfit, config),
            "3" => edit_percent(PercentSetting::StopLoss, config),
            "4" => Step::reply(MenuState::OrderStyle, render_order_style(config)),
            "5" => Step::reply(MenuState::Condition, render_condition_prompt(config)),
            _ => Step::reply(MenuState::NewBuySettings, "Invalid input."),
        },

        MenuState::GlobalSettings => match input {
            "0" => Step::reply(MenuState::Main, render_main()),
            "1" => edit_percent(PercentSetting::BuyRatio, config),
            "2" => edit_percent(PercentSetting::TakeProfit, config),
            "3" => edit_percent(PercentSetting::StopLoss, config),
            "4" => Step::reply(MenuState::OrderStyle, render_order_style(config)),
            "5" => Step::reply(
                MenuState::MaxPositions,
                format!(
                    "Max positions: {}\n\nEnter a number (1-50):",
                    config.snapshot().max_positions
                ),
            ),
            "6" => Step::reply(
                MenuState::MinAmount,
                format!(
                    "Minimum order: {} x 10,000 KRW\n\nEnter a multiple of 10,000 KRW (1-1000):",
                    (config.snapshot().min_order_amount / dec!(10000)).trunc()
                ),
            ),
            _ => Step::reply(MenuState::GlobalSettings, "Invalid input."),
        },

        MenuState::Status => match input {
            "0" => Step::reply(MenuState::Main, render_main()),
            _ => Step::reply(MenuState::Status, "Enter 0 to go back."),
        },

        MenuState::EditPercent { setting, direct } => {
            if !direct && input == DIRECT_ENTRY {
                return Step::reply(
                    MenuState::EditPercent {
                        setting,
                        direct: true,
                    },
                    format!("Enter the {} % directly (e.g. 8):", setting.label().to_lowercase()),
                );
            }

            let parsed = if direct {
                parse_direct(&clean_value(input))
            } else {
                parse_value_input(input, setting.kind())
            };
            let Some(value) = parsed else {
                return Step::reply(
                    MenuState::EditPercent { setting, direct },
                    "Invalid input. Enter 1-5 or a value between 0.1 and 50.",
                );
            };

            let edit = match setting {
                PercentSetting::BuyRatio => GlobalSetting::BuyRatio(value),
                PercentSetting::TakeProfit => GlobalSetting::TakeProfit(value),
                PercentSetting::StopLoss => GlobalSetting::StopLoss(-value),
            };
            let value = signed(setting == PercentSetting::StopLoss, value);
            apply_global(
                config,
                edit,
                format!("{} set to {}%.", setting.label(), signed_label(value)),
                MenuState::EditPercent { setting, direct },
            )
        }

        MenuState::OrderStyle => {
            let style = match input {
                "1" => OrderStyle::Limit,
                "2" => OrderStyle::Market,
                _ => return Step::reply(MenuState::OrderStyle, "Enter 1 or 2."),
            };
            apply_global(
                config,
                GlobalSetting::OrderStyle(style),
                format!("Order style set to {}.", style),
                MenuState::OrderStyle,
            )
        }

        MenuState::Condition => {
            if input.is_empty() {
                return Step::reply(MenuState::Condition, "Invalid input.");
            }
            apply_global(
                config,
                GlobalSetting::ConditionSeq(input.to_string()),
                format!(
                    "Condition set to #{}. It applies from the next stream connection.",
                    input
                ),
                MenuState::Condition,
            )
        }

        MenuState::MaxPositions => match input.parse::<usize>() {
            Ok(n) if (1..=50).contains(&n) => apply_global(
                config,
                GlobalSetting::MaxPositions(n),
                format!("Max positions set to {}.", n),
                MenuState::MaxPositions,
            ),
            Ok(_) => Step::reply(MenuState::MaxPositions, "Enter a number between 1 and 50."),
            Err(_) => Step::reply(MenuState::MaxPositions, "Please enter a number."),
        },

        MenuState::MinAmount => match input.parse::<u32>() {
            Ok(n) if (1..=1000).contains(&n) => apply_global(
                config,
                GlobalSetting::MinOrderAmount(Decimal::from(n) * dec!(10000)),
                format!("Minimum order set to {} x 10,000 KRW.", n),
                MenuState::MinAmount,
            ),
            Ok(_) => Step::reply(MenuState::MinAmount, "Enter a number between 1 and 1000."),
            Err(_) => Step::reply(MenuState::MinAmount, "Please enter a number."),
        },
    }
}

fn edit_percent(setting: PercentSetting, config: &ConfigStore) -> Step {
    let snapshot = config.snapshot();
    let current = match setting {
        PercentSetting::BuyRatio => snapshot.buy_ratio,
        PercentSetting::TakeProfit => snapshot.take_profit_pct,
        PercentSetting::StopLoss => snapshot.stop_loss_pct.abs(),
    };
    Step::reply(
        MenuState::EditPercent {
            setting,
            direct: false,
        },
        render_value_select(setting.label(), current, setting.kind()),
    )
}

/// Apply a global edit and return to the main menu, or stay on `retry`.
fn apply_global(config: &ConfigStore, edit: GlobalSetting, confirm: String, retry: MenuState) -> Step {
    match config.set_global(edit) {
        Ok(()) => Step::replies(MenuState::Main, vec![confirm, render_main()]),
        Err(e) => Step::reply(retry, format!("Rejected: {}", e)),
    }
}

fn signed(negative: bool, value: Decimal) -> Decimal {
    if negative {
        -value
    } else {
        value
    }
}

fn signed_label(value: Decimal) -> String {
    if value.is_sign_negative() {
        value.to_string()
    } else {
        format!("+{}", value)
    }
}

fn invalid(menu: &str) -> String {
    format!("Invalid input.\n\n{}", menu)
}

pub fn render_main() -> String {
    "Settings\n\n\
     1. Holdings\n\
     2. New-buy settings\n\
     3. Global settings\n\
     4. Current status\n\n\
     0. Close\n\n\
     Enter a number:"
        .to_string()
}

fn render_holdings(holdings: &[Holding]) -> String {
    if holdings.is_empty() {
        return "Holdings\n\nNo open positions.\n\n0. Back\n\nEnter a number:".to_string();
    }

    let mut out = String::from("Holdings\n\n");
    for (i, h) in holdings.iter().enumerate() {
        out.push_str(&format!("{}. {}  {}\n", i + 1, h.name, h.pct_label()));
    }
    out.push_str("\n0. Back\n\nEnter a holding number:");
    out
}

fn render_stock_detail(holding: &Holding, config: &ConfigStore) -> String {
    let effective = config.get_effective(&holding.symbol);
    let source = if config.has_override(&holding.symbol) {
        "custom"
    } else {
        "global"
    };
    format!(
        "{} {}\n\n\
         Thresholds: {}\n\n\
         1. Change take-profit [now: {}%]\n\
         2. Change stop-loss [now: {}%]\n\
         3. Sell now (market)\n\n\
         0. Back\n\n\
         Enter a number:",
        holding.name,
        holding.pct_label(),
        source,
        effective.take_profit,
        effective.stop_loss
    )
}

fn render_value_select(label: &str, current: Decimal, kind: ValueKind) -> String {
    let mut out = format!("{}\n\nCurrent: {}%\n\n", label, current);
    for (i, preset) in kind.presets().iter().enumerate() {
        out.push_str(&format!("{}. {}%\n", i + 1, preset));
    }
    out.push_str(&format!("{}. Enter directly\n\nEnter a number or value:", DIRECT_ENTRY));
    out
}

fn render_new_buy(config: &ConfigStore) -> String {
    let c = config.snapshot();
    format!(
        "New-buy settings\n\n\
         Applied when the condition matches.\n\n\
         1. Buy ratio [{}%]\n\
         2. Take-profit [{}%]\n\
         3. Stop-loss [{}%]\n\
         4. Order style [{}]\n\
         5. Condition [#{}]\n\n\
         0. Back\n\n\
         Enter a number:",
        c.buy_ratio, c.take_profit_pct, c.stop_loss_pct, c.order_style, c.condition_seq
    )
}

fn render_global(config: &ConfigStore) -> String {
    let c = config.snapshot();
    format!(
        "Global settings\n\n\
         1. Buy ratio      [{}%]\n\
         2. Take-profit    [{}%]\n\
         3. Stop-loss      [{}%]\n\
         4. Order style    [{}]\n\
         5. Max positions  [{}]\n\
         6. Min order      [{} x 10,000 KRW]\n\n\
         0. Back\n\n\
         Enter a number:",
        c.buy_ratio,
        c.take_profit_pct,
        c.stop_loss_pct,
        c.order_style,
        c.max_positions,
        (c.min_order_amount / dec!(10000)).trunc()
    )
}

fn render_order_style(config: &ConfigStore) -> String {
    format!(
        "Order style\n\nCurrent: {}\n\n\
         1. Limit (at best ask)\n\
         2. Market (immediate fill)\n\n\
         Enter a number:",
        config.snapshot().order_style
    )
}

fn render_condition_prompt(config: &ConfigStore) -> String {
    format!(
        "Current condition: #{}\n\nEnter the condition number:",
        config.snapshot().condition_seq
    )
}
