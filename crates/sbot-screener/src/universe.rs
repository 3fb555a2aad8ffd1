//! Universe ranking, enrichment and guardrail filtering.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::regime::MarketRegime;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Stock,
    Etf,
    Both,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetUniverseMode {
    /// Preset seed list only, no backfill.
    SeedOnly,
    /// Seeds first, then active-universe backfill up to the limit.
    SeedGuardrailBlend,
    /// Ignore seeds; active universe only.
    GuardrailOnly,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct SymbolCapability {
    pub tradable: bool,
    pub fractionable: bool,
}

impl Default for SymbolCapability {
    fn default() -> Self {
        Self {
            tradable: true,
            fractionable: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub name: String,
    pub asset_type: AssetType,
    pub volume: i64,
    pub price: f64,
    pub change_percent: f64,
    pub sector: String,
    pub dollar_volume: f64,
    pub spread_bps: f64,
    pub score: f64,
    pub tradable: bool,
    pub broker_tradable: bool,
    pub fractionable: bool,
    pub execution_ticket: f64,
    pub selection_reason: String,
}

impl Asset {
    pub fn quote(
        symbol: &str,
        name: &str,
        asset_type: AssetType,
        volume: i64,
        price: f64,
        change_percent: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: name.to_string(),
            asset_type,
            volume,
            price,
            change_percent,
            sector: String::new(),
            dollar_volume: 0.0,
            spread_bps: 0.0,
            score: 0.0,
            tradable: true,
            broker_tradable: true,
            fractionable: true,
            execution_ticket: 0.0,
            selection_reason: String::new(),
        }
    }

    /// Placeholder row for a preset seed with no live universe data.
    pub fn placeholder(symbol: &str, asset_type: AssetType) -> Self {
        Self::quote(symbol, symbol, asset_type, 0, 0.0, 0.0)
    }
}

/// Attach sector / spread / dollar-volume / composite score. Composite
/// score = 0.5·liquidity + 0.3·trend + 0.2·spread where liquidity is volume
/// relative to the batch max.
pub fn enrich_assets(assets: Vec<Asset>) -> Vec<Asset> {
    if assets.is_empty() {
        return assets;
    }
    let max_volume = assets.iter().map(|a| a.volume as f64).fold(0.0, f64::max).max(1.0);
    assets
        .into_iter()
        .map(|mut asset| {
            let volume = asset.volume as f64;
            let change = asset.change_percent.abs();
            asset.dollar_volume = round2(volume * asset.price);
            asset.spread_bps = round2((30.0 - (volume / 7_000_000.0).min(24.0)).max(4.0));
            asset.sector = infer_sector(&asset.symbol, asset.asset_type);
            let liquidity_score = (volume / max_volume * 100.0).min(100.0);
            let trend_score = (100.0 - change * 4.5).max(0.0);
            let spread_score = (100.0 - asset.spread_bps * 2.2).max(0.0);
            asset.score = round2(liquidity_score * 0.5 + trend_score * 0.3 + spread_score * 0.2);
            asset.tradable = true;
            asset.selection_reason = "Candidate in active universe".to_string();
            asset
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct OptimizeConfig {
    pub limit: usize,
    pub min_dollar_volume: f64,
    pub max_spread_bps: f64,
    pub max_sector_weight_pct: f64,
    pub regime: MarketRegime,
    pub auto_regime_adjust: bool,
    pub current_holdings: Vec<String>,
    pub buying_power: f64,
    pub equity: f64,
    pub weekly_budget: f64,
    pub symbol_capabilities: BTreeMap<String, SymbolCapability>,
    pub require_broker_tradable: bool,
    pub require_fractionable: bool,
    pub target_position_size: f64,
    pub dca_tranches: u32,
    pub min_fractional_notional: f64,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            limit: 20,
            min_dollar_volume: 10_000_000.0,
            max_spread_bps: 50.0,
            max_sector_weight_pct: 45.0,
            regime: MarketRegime::Unknown,
            auto_regime_adjust: true,
            current_holdings: Vec::new(),
            buying_power: 0.0,
            equity: 0.0,
            weekly_budget: 0.0,
            symbol_capabilities: BTreeMap::new(),
            require_broker_tradable: false,
            require_fractionable: false,
            target_position_size: 0.0,
            dca_tranches: 1,
            min_fractional_notional: 1.0,
        }
    }
}

/// Apply scoring plus liquidity / spread / sector-concentration guardrails
/// and select up to `limit` assets.
pub fn optimize_assets(assets: Vec<Asset>, cfg: &OptimizeConfig) -> Vec<Asset> {
    let mut min_dollar_volume = safe_non_negative(cfg.min_dollar_volume);
    let mut max_spread_bps = safe_non_negative(cfg.max_spread_bps);

    if cfg.auto_regime_adjust {
        match cfg.regime {
            MarketRegime::HighVolatilityRange => {
                max_spread_bps = max_spread_bps.min(35.0);
                min_dollar_volume = min_dollar_volume.max(15_000_000.0);
            }
            MarketRegime::TrendingUp => {
                max_spread_bps = (max_spread_bps + 10.0).min(90.0);
            }
            MarketRegime::TrendingDown => {
                min_dollar_volume = min_dollar_volume.max(18_000_000.0);
            }
            _ => {}
        }
    }

    let held: BTreeSet<String> = cfg
        .current_holdings
        .iter()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    let buying_power = safe_non_negative(cfg.buying_power);
    let equity = safe_non_negative(cfg.equity);
    let weekly_budget = safe_non_negative(cfg.weekly_budget);
    let budget_candidates: Vec<f64> = [buying_power, weekly_budget, equity * 0.20]
        .into_iter()
        .filter(|v| *v > 0.0)
        .collect();
    let portfolio_budget_cap = budget_candidates
        .into_iter()
        .fold(f64::INFINITY, f64::min);
    let portfolio_budget_cap = if portfolio_budget_cap.is_finite() {
        portfolio_budget_cap
    } else {
        0.0
    };

    let min_fractional_notional = safe_non_negative(cfg.min_fractional_notional).max(1.0);
    let dca_tranches = cfg.dca_tranches.max(1) as f64;
    let mut target_position_size = safe_non_negative(cfg.target_position_size);
    if target_position_size <= 0.0 {
        target_position_size = if weekly_budget > 0.0 {
            (weekly_budget * 0.5).max(min_fractional_notional)
        } else if portfolio_budget_cap > 0.0 {
            (portfolio_budget_cap * 0.4).max(min_fractional_notional)
        } else {
            100.0
        };
    }
    let per_tranche_target = (target_position_size / dca_tranches).max(min_fractional_notional);

    let mut candidates = enrich_assets(assets);
    let mut adjusted_scores: BTreeMap<String, f64> = BTreeMap::new();
    for asset in &mut candidates {
        let symbol = asset.symbol.to_ascii_uppercase();
        let capability = cfg
            .symbol_capabilities
            .get(&symbol)
            .copied()
            .unwrap_or_default();
        asset.broker_tradable = capability.tradable;
        asset.fractionable = capability.fractionable;

        let (estimated_ticket, raw_affordable) = if capability.fractionable {
            let ticket = if portfolio_budget_cap > 0.0 {
                per_tranche_target.min((portfolio_budget_cap * 0.60).max(min_fractional_notional))
            } else {
                per_tranche_target
            };
            let affordable =
                portfolio_budget_cap <= 0.0 || portfolio_budget_cap >= min_fractional_notional;
            (ticket, affordable)
        } else {
            let ticket = asset.price.max(per_tranche_target);
            let affordable =
                portfolio_budget_cap <= 0.0 || ticket <= portfolio_budget_cap * 1.10;
            (ticket, affordable)
        };
        let raw_affordable = raw_affordable || held.contains(&symbol);

        let mut execution_ready = raw_affordable;
        if cfg.require_broker_tradable && !capability.tradable {
            execution_ready = false;
        }
        if cfg.require_fractionable && !capability.fractionable {
            execution_ready = false;
        }

        asset.execution_ticket = round2(estimated_ticket);
        asset.tradable = asset.dollar_volume >= min_dollar_volume
            && asset.spread_bps <= max_spread_bps
            && execution_ready;

        let mut adjusted = asset.score;
        if held.contains(&symbol) {
            adjusted += 3.0;
        }
        if portfolio_budget_cap > 0.0 && estimated_ticket > portfolio_budget_cap {
            adjusted -= ((estimated_ticket / portfolio_budget_cap - 1.0) * 10.0).min(20.0);
        }
        if cfg.require_fractionable && !capability.fractionable {
            adjusted -= 25.0;
        }
        if cfg.require_broker_tradable && !capability.tradable {
            adjusted -= 25.0;
        }
        let adjusted = round2(adjusted);
        adjusted_scores.insert(symbol.clone(), adjusted);

        if asset.tradable {
            let mut reason = format!(
                "Score {:.1}; ${:.1}M dollar vol; {:.1} bps spread",
                adjusted,
                asset.dollar_volume / 1_000_000.0,
                asset.spread_bps
            );
            if held.contains(&symbol) {
                reason.push_str("; continuity boost");
            }
            if capability.fractionable {
                reason.push_str("; fractional-ready");
            }
            asset.selection_reason = reason;
        } else {
            let mut reasons: Vec<&str> = Vec::new();
            if asset.dollar_volume < min_dollar_volume {
                reasons.push("low dollar volume");
            }
            if asset.spread_bps > max_spread_bps {
                reasons.push("wide spread");
            }
            if cfg.require_broker_tradable && !capability.tradable {
                reasons.push("not broker tradable");
            }
            if cfg.require_fractionable && !capability.fractionable {
                reasons.push("not fractionable");
            }
            if !raw_affordable {
                reasons.push("budget constrained");
            }
            asset.selection_reason = format!("Filtered: {}", reasons.join(", "));
        }
    }

    let mut tradable_assets: Vec<Asset> =
        candidates.into_iter().filter(|a| a.tradable).collect();
    tradable_assets.sort_by(|a, b| {
        let sa = adjusted_scores.get(&a.symbol).copied().unwrap_or(a.score);
        let sb = adjusted_scores.get(&b.symbol).copied().unwrap_or(b.score);
        sb.total_cmp(&sa).then_with(|| a.symbol.cmp(&b.symbol))
    });

    let sector_fraction = (cfg.max_sector_weight_pct / 100.0).clamp(0.1, 1.0);
    let per_sector_cap = ((cfg.limit as f64 * sector_fraction).ceil() as usize).max(1);

    let mut selected: Vec<Asset> = Vec::new();
    let mut sector_counts: BTreeMap<String, usize> = BTreeMap::new();
    for asset in &tradable_assets {
        let count = sector_counts.entry(asset.sector.clone()).or_insert(0);
        if *count >= per_sector_cap {
            continue;
        }
        *count += 1;
        selected.push(asset.clone());
        if selected.len() >= cfg.limit {
            break;
        }
    }

    // Backfill from remaining tradables when sector caps left the list short.
    if selected.len() < cfg.limit {
        for asset in &tradable_assets {
            if selected.iter().any(|s| s.symbol == asset.symbol) {
                continue;
            }
            selected.push(asset.clone());
            if selected.len() >= cfg.limit {
                break;
            }
        }
    }

    selected.truncate(cfg.limit);
    selected
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Guardrails {
    pub min_dollar_volume: f64,
    pub max_spread_bps: f64,
    pub max_sector_weight_pct: f64,
}

/// Default guardrails per preset profile.
pub fn preset_guardrails(asset_type: AssetType, preset: &str) -> Guardrails {
    let key = (asset_type, preset.to_ascii_lowercase());
    let (min_dollar_volume, max_spread_bps, max_sector_weight_pct) = match (key.0, key.1.as_str()) {
        (AssetType::Stock, "weekly_optimized") => (20_000_000.0, 35.0, 40.0),
        (AssetType::Stock, "three_to_five_weekly") => (12_000_000.0, 45.0, 45.0),
        (AssetType::Stock, "monthly_optimized") => (8_000_000.0, 60.0, 50.0),
        (AssetType::Stock, "small_budget_weekly") => (5_000_000.0, 80.0, 55.0),
        (AssetType::Stock, "micro_budget") => (2_000_000.0, 150.0, 60.0),
        (AssetType::Etf, "conservative") => (15_000_000.0, 30.0, 35.0),
        (AssetType::Etf, "balanced") => (10_000_000.0, 40.0, 40.0),
        (AssetType::Etf, "aggressive") => (7_000_000.0, 55.0, 45.0),
        _ => (10_000_000.0, 50.0, 45.0),
    };
    Guardrails {
        min_dollar_volume,
        max_spread_bps,
        max_sector_weight_pct,
    }
}

/// Seed symbol list for a preset, if the preset exists for the asset type.
pub fn preset_symbols(asset_type: AssetType, preset: &str) -> Option<Vec<String>> {
    let preset = preset.to_ascii_lowercase();
    let symbols: &[&str] = match (asset_type, preset.as_str()) {
        (AssetType::Stock, "weekly_optimized") => {
            &["NVDA", "TSLA", "AMD", "META", "AMZN", "AAPL", "MSFT", "GOOGL", "INTC", "CRM"]
        }
        (AssetType::Stock, "three_to_five_weekly") => {
            &["AAPL", "MSFT", "AMZN", "GOOGL", "JPM", "V", "WMT", "KO", "PEP", "DIS"]
        }
        (AssetType::Stock, "monthly_optimized") => {
            &["MSFT", "AAPL", "GOOGL", "JPM", "V", "WMT", "PEP", "KO", "CSCO", "ORCL"]
        }
        (AssetType::Stock, "small_budget_weekly") => {
            &["INTC", "PFE", "CSCO", "PYPL", "BABA", "NKE", "DIS", "KO", "XLF", "IWM"]
        }
        (AssetType::Stock, "micro_budget") => {
            &["SPY", "INTC", "PFE", "CSCO", "KO", "VTI", "XLF", "DIS"]
        }
        (AssetType::Etf, "conservative") => {
            &["SPY", "VOO", "IVV", "AGG", "TLT", "XLP", "XLV", "VEA", "VTI", "DIA"]
        }
        (AssetType::Etf, "balanced") => {
            &["SPY", "QQQ", "VTI", "IWM", "XLF", "XLK", "XLI", "VEA", "VWO", "AGG"]
        }
        (AssetType::Etf, "aggressive") => {
            &["QQQ", "IWM", "XLE", "XLK", "XLY", "EEM", "VWO", "XLF", "SPY", "DIA"]
        }
        _ => return None,
    };
    Some(symbols.iter().map(|s| s.to_string()).collect())
}

/// Well-known liquid stocks, volume-ranked, used when no data source is
/// available. Volumes and prices form a deterministic ladder.
pub fn fallback_stocks(limit: usize) -> Vec<Asset> {
    const SEED: &[(&str, &str)] = &[
        ("TSLA", "Tesla Inc."),
        ("AAPL", "Apple Inc."),
        ("NVDA", "NVIDIA Corp."),
        ("AMD", "Advanced Micro Devices"),
        ("AMZN", "Amazon.com Inc."),
        ("MSFT", "Microsoft Corp."),
        ("META", "Meta Platforms Inc."),
        ("GOOGL", "Alphabet Inc."),
        ("INTC", "Intel Corp."),
        ("NFLX", "Netflix Inc."),
        ("DIS", "Walt Disney Co."),
        ("BABA", "Alibaba Group"),
        ("BA", "Boeing Co."),
        ("JPM", "JPMorgan Chase"),
        ("V", "Visa Inc."),
        ("WMT", "Walmart Inc."),
        ("PFE", "Pfizer Inc."),
        ("KO", "Coca-Cola Co."),
        ("PEP", "PepsiCo Inc."),
        ("NKE", "Nike Inc."),
        ("CSCO", "Cisco Systems"),
        ("ADBE", "Adobe Inc."),
        ("CRM", "Salesforce Inc."),
        ("ORCL", "Oracle Corp."),
        ("PYPL", "PayPal Holdings"),
        ("UBER", "Uber Technologies"),
        ("F", "Ford Motor Co."),
        ("GM", "General Motors"),
        ("T", "AT&T Inc."),
        ("VZ", "Verizon Communications"),
        ("XOM", "Exxon Mobil"),
        ("CVX", "Chevron Corp."),
        ("COP", "ConocoPhillips"),
        ("SLB", "Schlumberger"),
        ("CAT", "Caterpillar Inc."),
        ("DE", "Deere & Co."),
        ("GE", "GE Aerospace"),
        ("HON", "Honeywell"),
        ("MMM", "3M Co."),
        ("IBM", "IBM"),
        ("QCOM", "Qualcomm"),
        ("AVGO", "Broadcom"),
        ("TXN", "Texas Instruments"),
        ("MU", "Micron Technology"),
        ("GILD", "Gilead Sciences"),
        ("AMGN", "Amgen"),
        ("LLY", "Eli Lilly"),
        ("JNJ", "Johnson & Johnson"),
        ("MRK", "Merck & Co."),
        ("ABBV", "AbbVie"),
        ("UNH", "UnitedHealth"),
        ("COST", "Costco"),
        ("HD", "Home Depot"),
        ("MCD", "McDonald's"),
        ("SBUX", "Starbucks"),
        ("TGT", "Target Corp."),
        ("C", "Citigroup"),
        ("BAC", "Bank of America"),
        ("WFC", "Wells Fargo"),
        ("GS", "Goldman Sachs"),
    ];
    seeded_assets(SEED, AssetType::Stock, 130_000_000, 700_000, 1_000_000, limit)
}

/// Well-known liquid ETFs used when no data source is available.
pub fn fallback_etfs(limit: usize) -> Vec<Asset> {
    const SEED: &[(&str, &str)] = &[
        ("SPY", "SPDR S&P 500 ETF"),
        ("QQQ", "Invesco QQQ Trust"),
        ("IWM", "iShares Russell 2000 ETF"),
        ("VTI", "Vanguard Total Stock Market ETF"),
        ("EEM", "iShares MSCI Emerging Markets ETF"),
        ("GLD", "SPDR Gold Shares"),
        ("XLF", "Financial Select Sector SPDR"),
        ("XLE", "Energy Select Sector SPDR"),
        ("XLK", "Technology Select Sector SPDR"),
        ("TLT", "iShares 20+ Year Treasury Bond ETF"),
        ("VOO", "Vanguard S&P 500 ETF"),
        ("VEA", "Vanguard FTSE Developed Markets ETF"),
        ("AGG", "iShares Core U.S. Aggregate Bond ETF"),
        ("VWO", "Vanguard FTSE Emerging Markets ETF"),
        ("IVV", "iShares Core S&P 500 ETF"),
        ("DIA", "SPDR Dow Jones Industrial Average ETF"),
        ("XLV", "Health Care Select Sector SPDR"),
        ("XLI", "Industrial Select Sector SPDR"),
        ("XLP", "Consumer Staples Select Sector SPDR"),
        ("XLY", "Consumer Discretionary Select Sector SPDR"),
        ("XLC", "Communication Services Select Sector SPDR"),
        ("XLB", "Materials Select Sector SPDR"),
        ("XLRE", "Real Estate Select Sector SPDR"),
        ("XLU", "Utilities Select Sector SPDR"),
        ("SMH", "VanEck Semiconductor ETF"),
        ("SOXX", "iShares Semiconductor ETF"),
        ("HYG", "iShares iBoxx High Yield Corporate Bond ETF"),
        ("LQD", "iShares iBoxx Investment Grade Corporate Bond ETF"),
        ("BND", "Vanguard Total Bond Market ETF"),
        ("IEF", "iShares 7-10 Year Treasury Bond ETF"),
        ("SHY", "iShares 1-3 Year Treasury Bond ETF"),
        ("TIP", "iShares TIPS Bond ETF"),
        ("VNQ", "Vanguard Real Estate ETF"),
        ("GDX", "VanEck Gold Miners ETF"),
        ("SLV", "iShares Silver Trust"),
        ("USO", "United States Oil Fund"),
        ("KRE", "SPDR S&P Regional Banking ETF"),
        ("XBI", "SPDR S&P Biotech ETF"),
        ("EFA", "iShares MSCI EAFE ETF"),
        ("SCHD", "Schwab U.S. Dividend Equity ETF"),
    ];
    seeded_assets(SEED, AssetType::Etf, 90_000_000, 550_000, 800_000, limit)
}

fn seeded_assets(
    seed: &[(&str, &str)],
    asset_type: AssetType,
    base_volume: i64,
    volume_step: i64,
    volume_floor: i64,
    limit: usize,
) -> Vec<Asset> {
    let (price_mult, price_mod, price_base, change_mod, change_step) = match asset_type {
        AssetType::Etf => (5.8, 460.0, 25.0, 13i64, 0.18),
        _ => (7.3, 580.0, 20.0, 15i64, 0.22),
    };
    seed.iter()
        .enumerate()
        .take(limit)
        .map(|(idx, (symbol, name))| {
            let volume = (base_volume - idx as i64 * volume_step).max(volume_floor);
            let price = round2(price_base + (idx as f64 * price_mult) % price_mod);
            let change =
                round2(((idx as i64 % change_mod) - change_mod / 2) as f64 * change_step);
            Asset::quote(symbol, name, asset_type, volume, price, change)
        })
        .collect()
}

fn infer_sector(symbol: &str, asset_type: AssetType) -> String {
    if asset_type == AssetType::Etf {
        if symbol.starts_with("XL") {
            return "Sector ETF".to_string();
        }
        if matches!(symbol, "AGG" | "TLT" | "IEF" | "BND" | "SHY" | "LQD" | "TIP" | "HYG") {
            return "Fixed Income".to_string();
        }
        if matches!(symbol, "GLD" | "SLV" | "USO" | "UNG" | "DBC" | "GDX") {
            return "Commodities".to_string();
        }
        return "Broad Market ETF".to_string();
    }
    const TECH: &[&str] = &[
        "AAPL", "MSFT", "NVDA", "AMD", "INTC", "META", "GOOGL", "ORCL", "ADBE", "CRM", "IBM",
        "QCOM", "AVGO", "TXN", "MU", "CSCO",
    ];
    const FINANCE: &[&str] = &["JPM", "V", "MA", "C", "BAC", "WFC", "GS", "MS", "SCHW", "AXP"];
    const ENERGY: &[&str] = &["XOM", "CVX", "COP", "SLB", "OXY", "MPC", "PSX", "EOG"];
    const HEALTH: &[&str] = &[
        "PFE", "JNJ", "MRK", "ABBV", "UNH", "LLY", "AMGN", "GILD",
    ];
    const INDUSTRIAL: &[&str] = &["BA", "CAT", "DE", "GE", "HON", "MMM", "UNP", "CSX", "RTX", "LMT"];
    const CONSUMER: &[&str] = &[
        "AMZN", "WMT", "KO", "PEP", "NKE", "DIS", "MCD", "SBUX", "TGT", "COST", "HD",
    ];
    let sector = if TECH.contains(&symbol) {
        "Technology"
    } else if FINANCE.contains(&symbol) {
        "Financials"
    } else if ENERGY.contains(&symbol) {
        "Energy"
    } else if HEALTH.contains(&symbol) {
        "Healthcare"
    } else if INDUSTRIAL.contains(&symbol) {
        "Industrials"
    } else if CONSUMER.contains(&symbol) {
        "Consumer"
    } else {
        "Other"
    };
    sector.to_string()
}

fn safe_non_negative(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
