//! AWS Route53 challenge records

use crate::provider::{
    access_test_fqdn, challenge_record_fqdn, quote_txt, same_name, DnsProvider, DnsProviderError,
    DnsResult, ACCESS_TEST_VALUE, CHALLENGE_TTL,
};
use async_trait::async_trait;
use aws_sdk_route53::error::DisplayErrorContext;
use aws_sdk_route53::types::{
    Change, ChangeAction as SdkChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet,
    RrType,
};
use cm_common::CertificateRequest;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedZone {
    pub id: String,
    /// Zone apex, usually with a trailing dot
    pub name: String,
    pub private: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HostedZonePage {
    pub zones: Vec<HostedZone>,
    /// Set while more pages remain
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecordSet {
    pub name: String,
    pub ttl: i64,
    /// Quoted TXT values
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Upsert,
    Delete,
}

/// The Route53 calls the provider needs
#[async_trait]
pub trait Route53Api: Send + Sync + Debug {
    async fn list_hosted_zones(&self, marker: Option<String>) -> DnsResult<HostedZonePage>;

    async fn get_hosted_zone(&self, id: &str) -> DnsResult<HostedZone>;

    async fn change_txt_record(
        &self,
        zone_id: &str,
        action: ChangeAction,
        record: &TxtRecordSet,
    ) -> DnsResult<()>;

    /// TXT record sets starting at `start_name` in the zone's sort order
    async fn list_txt_records(&self, zone_id: &str, start_name: &str)
    -> DnsResult<Vec<TxtRecordSet>>;
}

/// [`Route53Api`] backed by the AWS SDK
#[derive(Debug, Clone)]
pub struct SdkRoute53 {
    client: aws_sdk_route53::Client,
}

impl SdkRoute53 {
    pub async fn connect(access_key_id: &str, secret_access_key: &str, region: &str) -> Self {
        let credentials = aws_sdk_route53::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "certman",
        );
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .credentials_provider(credentials)
            .load()
            .await;

        Self {
            client: aws_sdk_route53::Client::new(&config),
        }
    }
}

fn convert_zone(zone: &aws_sdk_route53::types::HostedZone) -> HostedZone {
    HostedZone {
        id: zone.id().to_string(),
        name: zone.name().to_string(),
        private: zone.config().map(|c| c.private_zone()).unwrap_or(false),
    }
}

fn build_error(e: aws_sdk_route53::error::BuildError) -> DnsProviderError {
    DnsProviderError::ApiRequest(format!("Invalid Route53 request: {}", e))
}

#[async_trait]
impl Route53Api for SdkRoute53 {
    async fn list_hosted_zones(&self, marker: Option<String>) -> DnsResult<HostedZonePage> {
        let output = self
            .client
            .list_hosted_zones()
            .set_marker(marker)
            .send()
            .await
            .map_err(|e| {
                DnsProviderError::ApiRequest(format!(
                    "Failed to list hosted zones: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let next_marker = if output.is_truncated() {
            output.next_marker().map(str::to_string)
        } else {
            None
        };

        Ok(HostedZonePage {
            zones: output.hosted_zones().iter().map(convert_zone).collect(),
            next_marker,
        })
    }

    async fn get_hosted_zone(&self, id: &str) -> DnsResult<HostedZone> {
        let output = self
            .client
            .get_hosted_zone()
            .id(id)
            .send()
            .await
            .map_err(|e| {
                DnsProviderError::ApiRequest(format!(
                    "Failed to get hosted zone {}: {}",
                    id,
                    DisplayErrorContext(&e)
                ))
            })?;

        output
            .hosted_zone()
            .map(convert_zone)
            .ok_or_else(|| DnsProviderError::ZoneNotFound {
                zone: id.to_string(),
            })
    }

    async fn change_txt_record(
        &self,
        zone_id: &str,
        action: ChangeAction,
        record: &TxtRecordSet,
    ) -> DnsResult<()> {
        let mut record_set = ResourceRecordSet::builder()
            .name(&record.name)
            .r#type(RrType::Txt)
            .ttl(record.ttl);
        for value in &record.values {
            let resource_record = ResourceRecord::builder()
                .value(value)
                .build()
                .map_err(build_error)?;
            record_set = record_set.resource_records(resource_record);
        }

        let action = match action {
            ChangeAction::Upsert => SdkChangeAction::Upsert,
            ChangeAction::Delete => SdkChangeAction::Delete,
        };
        let change = Change::builder()
            .action(action)
            .resource_record_set(record_set.build().map_err(build_error)?)
            .build()
            .map_err(build_error)?;
        let batch = ChangeBatch::builder()
            .changes(change)
            .build()
            .map_err(build_error)?;

        self.client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|e| {
                DnsProviderError::ApiRequest(format!(
                    "Failed to change record {}: {}",
                    record.name,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn list_txt_records(
        &self,
        zone_id: &str,
        start_name: &str,
    ) -> DnsResult<Vec<TxtRecordSet>> {
        let output = self
            .client
            .list_resource_record_sets()
            .hosted_zone_id(zone_id)
            .start_record_name(start_name)
            .start_record_type(RrType::Txt)
            .send()
            .await
            .map_err(|e| {
                DnsProviderError::ApiRequest(format!(
                    "Failed to list records from {}: {}",
                    start_name,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(output
            .resource_record_sets()
            .iter()
            .filter(|set| set.r#type() == &RrType::Txt)
            .map(|set| TxtRecordSet {
                name: set.name().to_string(),
                ttl: set.ttl().unwrap_or(CHALLENGE_TTL as i64),
                values: set
                    .resource_records()
                    .iter()
                    .map(|r| r.value().to_string())
                    .collect(),
            })
            .collect())
    }
}

/// DNS provider writing into Route53 public hosted zones
#[derive(Debug, Clone)]
pub struct Route53Provider {
    api: Arc<dyn Route53Api>,
    /// FedRAMP clusters write every record to this zone
    fedramp_zone_id: Option<String>,
}

impl Route53Provider {
    pub fn new(api: Arc<dyn Route53Api>, fedramp_zone_id: Option<String>) -> Self {
        Self {
            api,
            fedramp_zone_id,
        }
    }

    /// Every hosted zone of the account, following the pagination marker to the end
    pub async fn list_all_hosted_zones(&self) -> DnsResult<Vec<HostedZone>> {
        let mut zones = Vec::new();
        let mut marker = None;
        loop {
            let page = self.api.list_hosted_zones(marker).await?;
            zones.extend(page.zones);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        debug!(count = zones.len(), "Listed Route53 hosted zones");
        Ok(zones)
    }

    async fn find_public_zone(&self, base_domain: &str) -> DnsResult<Option<HostedZone>> {
        if let Some(zone_id) = &self.fedramp_zone_id {
            let zone = self.api.get_hosted_zone(zone_id).await?;
            return Ok((!zone.private).then_some(zone));
        }

        Ok(self
            .list_all_hosted_zones()
            .await?
            .into_iter()
            .find(|zone| !zone.private && same_name(&zone.name, base_domain)))
    }

    async fn zone_for(&self, request: &CertificateRequest) -> DnsResult<HostedZone> {
        self.find_public_zone(&request.acme_dns_domain)
            .await?
            .ok_or_else(|| DnsProviderError::ZoneNotFound {
                zone: request.acme_dns_domain.clone(),
            })
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn answer_challenge(
        &self,
        key_authorization: &str,
        domain: &str,
        request: &CertificateRequest,
    ) -> DnsResult<String> {
        let zone = self.zone_for(request).await?;
        let fqdn = challenge_record_fqdn(domain);

        let record = TxtRecordSet {
            name: fqdn.clone(),
            ttl: CHALLENGE_TTL as i64,
            values: vec![quote_txt(key_authorization)],
        };
        self.api
            .change_txt_record(&zone.id, ChangeAction::Upsert, &record)
            .await
            .map_err(|e| DnsProviderError::WriteFailure {
                record_name: fqdn.clone(),
                message: e.to_string(),
            })?;

        info!(fqdn = %fqdn, zone = %zone.name, "Route53 challenge record upserted");
        Ok(fqdn)
    }

    async fn validate_write_access(&self, request: &CertificateRequest) -> DnsResult<bool> {
        let Some(zone) = self.find_public_zone(&request.acme_dns_domain).await? else {
            warn!(zone = %request.acme_dns_domain, "No public Route53 zone, write access denied");
            return Ok(false);
        };

        let probe = TxtRecordSet {
            name: access_test_fqdn(&zone.name),
            ttl: CHALLENGE_TTL as i64,
            values: vec![quote_txt(ACCESS_TEST_VALUE)],
        };
        self.api
            .change_txt_record(&zone.id, ChangeAction::Upsert, &probe)
            .await?;
        self.api
            .change_txt_record(&zone.id, ChangeAction::Delete, &probe)
            .await?;

        debug!(zone = %zone.name, "Route53 write access confirmed");
        Ok(true)
    }

    async fn delete_challenge_records(&self, request: &CertificateRequest) -> DnsResult<()> {
        let zone = self.zone_for(request).await?;

        for name in &request.dns_names {
            let fqdn = challenge_record_fqdn(name);
            let record_sets = match self.api.list_txt_records(&zone.id, &fqdn).await {
                Ok(sets) => sets,
                Err(e) => {
                    warn!(fqdn = %fqdn, error = %e, "Failed to list challenge records");
                    continue;
                }
            };

            for set in record_sets.iter().filter(|set| same_name(&set.name, &fqdn)) {
                match self
                    .api
                    .change_txt_record(&zone.id, ChangeAction::Delete, set)
                    .await
                {
                    Ok(()) => info!(fqdn = %fqdn, "Route53 challenge record deleted"),
                    Err(e) => warn!(fqdn = %fqdn, error = %e, "Failed to delete challenge record"),
                }
            }
        }
        Ok(())
    }
}
