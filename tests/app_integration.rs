use siglo_fundos::core::model::TableName;
use siglo_fundos::core::month::ReferenceMonth;
use siglo_fundos::store::{MemoryWarehouse, Warehouse};
use siglo_fundos::{AppCommand, RunOptions, run_command, run_with_warehouse};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

mod test_utils {
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zip::write::SimpleFileOptions;

    pub const FUND: &str = "00.017.024/0001-53";

    pub const DAILY_HEADER: &str =
        "CNPJ_FUNDO_CLASSE;DT_COMPTC;VL_TOTAL;VL_QUOTA;VL_PATRIM_LIQ;CAPTC_DIA;RESG_DIA;NR_COTST";

    pub fn zip_bytes(entries: &[(&str, String)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    async fn serve(server: &MockServer, url_path: String, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(url_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    /// CVM mirror with daily archives for January and February 2024 and a
    /// monthly archive for January only. FIM archives answer 404.
    pub async fn create_cvm_server(january_rows: &[&str]) -> MockServer {
        let server = MockServer::start().await;

        let mut january = vec![DAILY_HEADER.to_string()];
        january.extend(january_rows.iter().map(|r| r.to_string()));
        serve(
            &server,
            "/FI/DOC/INF_DIARIO/DADOS/inf_diario_fi_202401.zip".to_string(),
            zip_bytes(&[("inf_diario_fi_202401.csv", january.join("\n"))]),
        )
        .await;

        let february = [
            DAILY_HEADER.to_string(),
            format!("{FUND};2024-02-01;1100,00;1,10;1100,00;0;0;12"),
            "99.999.999/0001-99;2024-02-01;1;1;1;0;0;1".to_string(),
        ];
        serve(
            &server,
            "/FI/DOC/INF_DIARIO/DADOS/inf_diario_fi_202402.zip".to_string(),
            zip_bytes(&[("inf_diario_fi_202402.csv", february.join("\n"))]),
        )
        .await;

        serve(
            &server,
            "/FI/DOC/INF_MENSAL/DADOS/inf_mensal_fi_202401.zip".to_string(),
            zip_bytes(&[
                (
                    "inf_mensal_fi_carteira_202401.csv",
                    format!(
                        "CNPJ_FUNDO;DT_COMPTC;TP_APLIC;EMISSOR;COD_ISIN;VL_MERC_POS_FINAL\n\
                         {FUND};2024-01-31;Titulos Publicos;Tesouro Nacional;BRSTNCLTN7D3;750,00\n\
                         {FUND};2024-01-31;Disponibilidades;Banco XYZ;;250,00\n"
                    ),
                ),
                (
                    "inf_mensal_fi_cotistas_202401.csv",
                    format!(
                        "CNPJ_FUNDO;DT_COMPTC;CLASSE_COTISTAS;QT_COTISTAS;VL_PATRIM_LIQ\n\
                         {FUND};2024-01-31;Pessoa fisica;10;1000,00\n\
                         {FUND};2024-01-31;Pessoa juridica;2;1000,00\n"
                    ),
                ),
            ]),
        )
        .await;

        server
    }

    pub fn january_rows() -> Vec<String> {
        vec![
            format!("{FUND};2024-01-03;1010,00;1,01;1010,00;10;0;10"),
            format!("{FUND};2024-01-02;1000,00;1,00;1000,00;0;0;10"),
        ]
    }
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Workspace {
            dir: TempDir::new().unwrap(),
        }
    }

    fn write_config(&self, cvm_url: &str, extra: &str) -> std::path::PathBuf {
        let path = self.dir.path().join("pipeline.yaml");
        let config = format!(
            r#"
retroactive_months: 2
funds:
  - cnpj: "{fund}"
    name: Fundo Teste
    cvm_category: Renda Fixa
    manager: Gestora X
    anbima_class: Soberano
providers:
  cvm:
    base_url: "{cvm_url}"
{extra}
"#,
            fund = test_utils::FUND,
        );
        fs::write(&path, config).unwrap();
        path
    }

    fn options(&self, config_path: &Path) -> RunOptions {
        RunOptions {
            config_path: config_path.to_path_buf(),
            output_dir: self.output(),
            workdir: Some(self.dir.path().join("cache")),
            reference_month: Some(ReferenceMonth::new(2024, 2).unwrap()),
            show_progress: false,
        }
    }

    fn output(&self) -> std::path::PathBuf {
        self.dir.path().join("output")
    }

    fn read_rows(&self, table: TableName) -> Vec<Vec<String>> {
        let path = self
            .output()
            .join(table.layer().dir_name())
            .join(format!("{}.csv", table.as_str()));
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }
}

const WAREHOUSE: &str = r#"
bigquery:
  project: proj
  staging_dataset: stg
  curated_dataset: cur
"#;

fn january_rows() -> Vec<String> {
    test_utils::january_rows()
}

fn as_strs(rows: &[String]) -> Vec<&str> {
    rows.iter().map(String::as_str).collect()
}

#[test_log::test(tokio::test)]
async fn test_export_local_writes_every_table() {
    let rows = january_rows();
    let server = test_utils::create_cvm_server(&as_strs(&rows)).await;
    let ws = Workspace::new();
    let config = ws.write_config(&server.uri(), "");

    let report = run_command(AppCommand::ExportLocal, &ws.options(&config))
        .await
        .unwrap();
    info!("{}", report.display_as_table());

    assert_eq!(report.written.len(), TableName::ALL.len());
    for table in TableName::ALL {
        assert!(
            ws.output()
                .join(table.layer().dir_name())
                .join(format!("{}.csv", table.as_str()))
                .exists(),
            "{table} was not written"
        );
    }

    let daily = ws.read_rows(TableName::FatoCotaDiaria);
    let dates: Vec<_> = daily.iter().map(|r| r[1].as_str()).collect();
    // Three days across two months, sorted, and nothing of the unmonitored fund
    assert_eq!(dates, vec!["2024-01-02", "2024-01-03", "2024-02-01"]);
    assert!(daily.iter().all(|r| r[0] == "00017024000153" && r[8] == "CVM"));
    assert_eq!(daily[0][3], "1");

    let portfolio = ws.read_rows(TableName::FatoCarteiraMensal);
    assert_eq!(portfolio.len(), 2);
    let weights: Vec<_> = portfolio.iter().map(|r| r[10].as_str()).collect();
    assert!(weights.contains(&"0.75") && weights.contains(&"0.25"));

    let shareholders = ws.read_rows(TableName::FatoCotistasMensal);
    let classes: Vec<_> = shareholders
        .iter()
        .map(|r| (r[2].as_str(), r[3].as_str()))
        .collect();
    assert_eq!(classes, vec![("Pessoa fisica", "10"), ("Pessoa juridica", "2")]);

    let curated = ws.read_rows(TableName::CuratedCotasPorCategoria);
    assert_eq!(curated.len(), 2);
    assert_eq!(curated[0][1], "Renda Fixa");

    let collect = report.collect.unwrap();
    assert_eq!(collect.months.len(), 2);
    // Both FIM archives and the February monthly archive are missing
    assert_eq!(collect.unavailable.len(), 3);
    assert_eq!(collect.total_rejections(), 0);
    assert!(report.uploaded.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_malformed_record_is_counted_and_skipped() {
    let mut rows = january_rows();
    rows.push(format!(
        "{};2024-01-04;1;não é número;1;0;0;1",
        test_utils::FUND
    ));
    rows.push(";2024-01-05;1;1;1;0;0;1".to_string());
    let server = test_utils::create_cvm_server(&as_strs(&rows)).await;
    let ws = Workspace::new();
    let config = ws.write_config(&server.uri(), "");

    let report = run_command(AppCommand::ExportLocal, &ws.options(&config))
        .await
        .unwrap();

    let collect = report.collect.unwrap();
    assert_eq!(collect.rejections.get(&TableName::FatoCotaDiaria), Some(&2));
    assert_eq!(ws.read_rows(TableName::FatoCotaDiaria).len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_b3_rows_only_when_enabled() {
    let rows = january_rows();
    let server = test_utils::create_cvm_server(&as_strs(&rows)).await;
    let ws = Workspace::new();
    let sheet = ws.dir.path().join("b3.csv");
    fs::write(
        &sheet,
        format!(
            "CNPJ do Fundo;Data;Valor da Cota;Patrimônio Líquido\n\
             {fund};02/01/2024;9,99;9,99\n\
             {fund};04/01/2024;1,02;1020,00\n",
            fund = test_utils::FUND
        ),
    )
    .unwrap();

    for enabled in [false, true] {
        let extra = format!(
            "b3:\n  enabled: {enabled}\n  spreadsheets: [\"{}\"]\n",
            sheet.display()
        );
        let config = ws.write_config(&server.uri(), &extra);
        run_command(AppCommand::ExportLocal, &ws.options(&config))
            .await
            .unwrap();

        let daily = ws.read_rows(TableName::FatoCotaDiaria);
        let b3_rows: Vec<_> = daily.iter().filter(|r| r[8] == "B3").collect();
        if enabled {
            // CVM keeps 2024-01-02; B3 only fills 2024-01-04
            assert_eq!(b3_rows.len(), 1);
            assert_eq!(b3_rows[0][1], "2024-01-04");
            assert_eq!(daily.len(), 4);
        } else {
            assert!(b3_rows.is_empty());
            assert_eq!(daily.len(), 3);
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_ingest_reports_load_failure_and_continues() {
    let rows = january_rows();
    let server = test_utils::create_cvm_server(&as_strs(&rows)).await;
    let ws = Workspace::new();
    let config = ws.write_config(&server.uri(), WAREHOUSE);

    let warehouse =
        Arc::new(MemoryWarehouse::new().with_failing(TableName::CuratedCotasPorGestora));
    let report = run_with_warehouse(
        AppCommand::Ingest {
            skip_bigquery: false,
        },
        &ws.options(&config),
        Some(Arc::clone(&warehouse) as Arc<dyn Warehouse>),
    )
    .await
    .unwrap();

    assert!(report.has_failures());
    assert_eq!(report.load_failures.len(), 1);
    assert_eq!(
        report.load_failures[0].table,
        TableName::CuratedCotasPorGestora
    );
    assert_eq!(report.uploaded.len(), TableName::ALL.len() - 1);
    // Tables after the failed one were still loaded
    assert!(
        warehouse
            .loaded_tables()
            .contains(&TableName::CuratedCotasPorGrupoLooker)
    );
}

#[test_log::test(tokio::test)]
async fn test_upload_bigquery_uses_existing_csvs() {
    let rows = january_rows();
    let server = test_utils::create_cvm_server(&as_strs(&rows)).await;
    let ws = Workspace::new();
    let config = ws.write_config(&server.uri(), WAREHOUSE);
    let options = ws.options(&config);

    run_command(AppCommand::ExportLocal, &options).await.unwrap();
    fs::write(ws.output().join("staging").join("scratch.csv"), "x\n").unwrap();

    let warehouse = Arc::new(MemoryWarehouse::new());
    let report = run_with_warehouse(
        AppCommand::UploadBigquery,
        &options,
        Some(Arc::clone(&warehouse) as Arc<dyn Warehouse>),
    )
    .await
    .unwrap();

    assert!(!report.has_failures());
    assert_eq!(warehouse.loaded_tables().len(), TableName::ALL.len());
    assert!(report.collect.is_none());
}

#[test_log::test(tokio::test)]
async fn test_upload_bigquery_without_csvs_fails() {
    let ws = Workspace::new();
    let config = ws.write_config("http://127.0.0.1:9", WAREHOUSE);

    let result = run_with_warehouse(
        AppCommand::UploadBigquery,
        &ws.options(&config),
        Some(Arc::new(MemoryWarehouse::new()) as Arc<dyn Warehouse>),
    )
    .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("No CSV found"));
}

#[test_log::test(tokio::test)]
async fn test_missing_warehouse_config_aborts_before_io() {
    let rows = january_rows();
    let server = test_utils::create_cvm_server(&as_strs(&rows)).await;
    let ws = Workspace::new();
    let config = ws.write_config(&server.uri(), "");

    let result = run_with_warehouse(
        AppCommand::Ingest {
            skip_bigquery: false,
        },
        &ws.options(&config),
        Some(Arc::new(MemoryWarehouse::new()) as Arc<dyn Warehouse>),
    )
    .await;

    assert!(result.is_err());
    assert!(!ws.output().exists());
    assert!(server.received_requests().await.unwrap_or_default().is_empty());

    // The same configuration is fine when the upload is skipped
    let report = run_command(
        AppCommand::Ingest {
            skip_bigquery: true,
        },
        &ws.options(&config),
    )
    .await
    .unwrap();
    assert!(report.uploaded.is_empty());
    assert!(ws.output().join("staging").join("dim_fundo.csv").exists());
}

#[test_log::test(tokio::test)]
async fn test_invalid_config_is_rejected() {
    let ws = Workspace::new();
    let path = ws.dir.path().join("pipeline.yaml");
    fs::write(&path, "retroactive_months: 3\nfunds: []\n").unwrap();

    let result = run_command(AppCommand::ExportLocal, &ws.options(&path)).await;
    assert!(result.is_err());
    assert!(!ws.output().exists());
}

#[test_log::test(tokio::test)]
async fn test_export_frontend_after_export_local() {
    let rows = january_rows();
    let server = test_utils::create_cvm_server(&as_strs(&rows)).await;
    let ws = Workspace::new();
    let config = ws.write_config(&server.uri(), "");
    let options = ws.options(&config);

    // Nothing to export before a local run
    assert!(
        run_command(AppCommand::ExportFrontend { frontend_dir: None }, &options)
            .await
            .is_err()
    );

    run_command(AppCommand::ExportLocal, &options).await.unwrap();
    let report = run_command(AppCommand::ExportFrontend { frontend_dir: None }, &options)
        .await
        .unwrap();

    let export = report.frontend.unwrap();
    assert_eq!(export.funds, 1);
    let fund: serde_json::Value = serde_json::from_slice(
        &fs::read(
            ws.output()
                .join("frontend")
                .join("funds")
                .join("00017024000153.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(fund["metadata"]["nome"], "Fundo Teste");
    assert_eq!(fund["series"]["daily"].as_array().map(Vec::len), Some(3));
    assert_eq!(fund["latest_holdings"]["top"][0]["isin"], "BRSTNCLTN7D3");
}
